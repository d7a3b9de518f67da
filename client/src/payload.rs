//! Request bodies and query strings

use serde_json::{json, Map, Value};

use flowload_core::{ArtifactQuery, JobId, SecondaryJobSpec, TableRef, TargetParams, UploadTarget};

use crate::config::ClientConfig;

/// Shallow-merge the keys of `extra` into `base`
fn merge(base: &mut Value, extra: Option<&Value>) {
    if let (Some(base), Some(Value::Object(extra))) = (base.as_object_mut(), extra) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// Job body from the template with `label` and `blocks` filled in
fn job_body(config: &ClientConfig, label: &str, blocks: Vec<Value>) -> Value {
    let mut body = config
        .job_template
        .clone()
        .unwrap_or_else(|| Value::Object(Map::new()));
    if let Some(fields) = body.as_object_mut() {
        fields.insert("label".into(), Value::String(label.to_string()));
        let inactive = fields
            .entry("config_inactive")
            .or_insert_with(|| json!({}));
        if let Some(inactive) = inactive.as_object_mut() {
            inactive.insert("blocks".into(), Value::Array(blocks));
        }
    }
    body
}

/// Upload session id shared by every upload call of a job
pub fn upload_id(config: &ClientConfig, job: JobId) -> String {
    format!("{job}_{}", config.loader_block_id)
}

/// Rison query selecting one block's parameters of a job
pub fn dag_params_query(block: u32, job: JobId) -> String {
    format!("(active:!f,block_id:{block},enum_limit:20,flow_id:{job})")
}

/// Body of `create_job`
pub fn create_job(config: &ClientConfig, label: &str) -> Value {
    job_body(config, label, Vec::new())
}

/// Body of `update_job`: the job with its loader block configured
pub fn update_job(config: &ClientConfig, job: JobId, label: &str, target: &TargetParams) -> Value {
    let mut block_config = json!({
        "delimiter": ",",
        "encoding": "UTF-8",
        "file_type": "CSV",
        "if_exists": "replace",
        "skip_rows": 0,
        "is_config_valid": true,
        "target_connection": target.connection,
        "target_schema": target.schema,
        "target_table": label,
        "fileUploaded": false,
        "upload_id": upload_id(config, job),
        "count_chunks": "0",
        "preview": {},
    });
    merge(&mut block_config, config.loader_block_template.as_ref());

    let block = json!({
        "block_id": config.loader_block_id,
        "id": config.loader_block_id,
        "dag_id": config.loader_process,
        "type": config.loader_process,
        "config": block_config,
        "number": 1,
        "parent_ids": [],
        "status": "deferred",
        "is_deprecated": false,
    });
    job_body(config, label, vec![block])
}

/// Body of `start_upload`
pub fn start_upload(config: &ClientConfig, target: &UploadTarget, total_chunks: usize) -> Value {
    json!({
        "upload_id": upload_id(config, target.job_id),
        "database_id": target.database_id.to_string(),
        "table_name": target.table,
        "schema": target.schema,
        "flow_id": target.job_id.to_string(),
        "block_id": config.loader_block_id,
        "total_chunks": total_chunks.to_string(),
    })
}

/// Text fields of one chunk's multipart form
pub fn chunk_fields(
    config: &ClientConfig,
    target: &UploadTarget,
    number: usize,
    total_chunks: usize,
) -> Vec<(&'static str, String)> {
    vec![
        ("upload_id", upload_id(config, target.job_id)),
        ("database_id", target.database_id.to_string()),
        ("schema", target.schema.clone()),
        ("table_name", target.table.clone()),
        ("part_num", number.to_string()),
        ("total_chunks", total_chunks.to_string()),
        ("block_id", config.loader_block_id.clone()),
        ("flow_id", target.job_id.to_string()),
    ]
}

/// Body of `finalize_upload`
pub fn finalize_upload(config: &ClientConfig, target: &UploadTarget, uploaded: usize) -> Value {
    json!({
        "count_chunks": uploaded,
        "upload_id": upload_id(config, target.job_id),
    })
}

/// Body of `start_processing`
pub fn start_processing(config: &ClientConfig, target: &UploadTarget) -> Value {
    let mut block_config = json!({
        "fileUploaded": false,
        "target_schema": target.schema,
        "target_table": target.table,
        "upload_id": upload_id(config, target.job_id),
        "preview": {},
    });
    merge(&mut block_config, config.loader_block_template.as_ref());

    json!({
        "flow_id": target.job_id.0,
        "block_id": config.loader_block_id,
        "config": block_config,
    })
}

/// Body of the row count query
pub fn row_count_query(table: &TableRef) -> Value {
    json!({
        "client_id": "",
        "database_id": table.database_id.to_string(),
        "json": true,
        "runAsync": false,
        "schema": table.schema,
        "sql": format!("SELECT COUNT(*) FROM {}", table.qualified_name()),
        "tab": "flowload validation",
        "tmp_table_name": "",
        "select_as_cta": false,
        "ctas_method": "TABLE",
        "queryLimit": 1000,
        "expand_data": true,
    })
}

/// Configured block of the secondary process
pub fn secondary_block(config: &ClientConfig, spec: &SecondaryJobSpec) -> Value {
    let mut block_config = json!({
        "source_connection": spec.source.connection,
        "source_schema": spec.source.schema,
        "source_table": spec.table,
        "dashboard_title": spec.table,
        "is_config_valid": true,
    });
    merge(&mut block_config, config.secondary_block_template.as_ref());

    let block_id = config.secondary_block_id();
    json!({
        "block_id": block_id,
        "id": block_id,
        "dag_id": config.secondary_process,
        "type": config.secondary_process,
        "config": block_config,
        "number": 1,
        "parent_ids": [],
        "status": "deferred",
        "is_deprecated": false,
    })
}

/// Body of `create_secondary_job`
pub fn create_secondary_job(config: &ClientConfig, spec: &SecondaryJobSpec) -> Value {
    job_body(config, &spec.label, vec![secondary_block(config, spec)])
}

/// Body of the secondary trigger; `block` is what the job was created with
pub fn trigger_secondary(block: Option<Value>) -> Value {
    json!({ "config": { "blocks": block.into_iter().collect::<Vec<_>>() } })
}

/// Encoded `q` parameter of the artifact lookup
pub fn artifact_query(query: &ArtifactQuery) -> String {
    let filter = format!(
        "(filters:!(\
         (col:flow_id,opr:eq,value:'{}'),\
         (col:block_id,opr:eq,value:'{}'),\
         (col:block_dag_run_id,opr:eq,value:'{}'),\
         (col:flow_dag_run_id,opr:eq,value:'{}')\
         ),order_column:timestamp,order_direction:desc,page:0,page_size:12)",
        query.job_id, query.block_id, query.block_run_id, query.run_id
    );
    urlencoding::encode(&filter).into_owned()
}
