//! Job creation.

use serde::Deserialize;
use serde_json::{json, Value};

use super::StageContext;
use crate::codec::{DelimitedOptions, Schema};
use crate::errors::OrchestratorError;
use crate::model::{JobDescriptor, JobHandle, JobId, JobStage};
use crate::transport::{TransportError, TransportRequest};

#[derive(Debug, Deserialize)]
struct CreateJobResponse {
    #[serde(default)]
    id: String,
}

/// Creates jobs on the service.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobSubmitter;

impl JobSubmitter {
    /// The JSON body announcing a job.
    #[must_use]
    pub fn request_body(
        descriptor: &JobDescriptor,
        options: &DelimitedOptions,
        schema: Option<&Schema>,
    ) -> Value {
        let mut body = json!({
            "object": descriptor.target_collection(),
            "externalIdFieldName": descriptor.correlation_key(),
            "operation": descriptor.operation().as_str(),
            "contentType": descriptor.content_format().wire_name(),
            "lineEnding": options.line_ending.wire_name(),
            "columnDelimiter": options.wire_delimiter_name().unwrap_or("COMMA"),
        });
        if let Some(schema) = schema {
            body["schema"] = json!(schema);
        }
        body
    }

    /// Creates a job and returns its handle in state `Open`.
    pub async fn create_job(
        ctx: &StageContext<'_>,
        descriptor: &JobDescriptor,
        schema: Option<&Schema>,
    ) -> Result<JobHandle, OrchestratorError> {
        let body = Self::request_body(descriptor, &ctx.options.delimited, schema);
        let request = TransportRequest::post_json(ctx.endpoints.jobs_url(), &body);

        let job_id = ctx
            .send(JobStage::Submit, request, |response| {
                let created: CreateJobResponse = response.json()?;
                if created.id.trim().is_empty() {
                    return Err(TransportError::malformed("job creation returned no id"));
                }
                Ok(JobId::from(created.id))
            })
            .await?;

        tracing::info!(
            job_id = %job_id,
            object = descriptor.target_collection(),
            operation = descriptor.operation().as_str(),
            "Created bulk job"
        );
        Ok(JobHandle::new(job_id, descriptor.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldType, SchemaField};
    use crate::model::Operation;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_body_fields() {
        let descriptor = JobDescriptor::new("Case", "Id", Operation::Update);
        let body = JobSubmitter::request_body(&descriptor, &DelimitedOptions::default(), None);
        assert_eq!(
            body,
            json!({
                "object": "Case",
                "externalIdFieldName": "Id",
                "operation": "update",
                "contentType": "CSV",
                "lineEnding": "LF",
                "columnDelimiter": "COMMA",
            })
        );
    }

    #[test]
    fn test_request_body_includes_schema() {
        let descriptor =
            JobDescriptor::new("fact_orders", "order_id", Operation::Insert).with_declared_schema();
        let schema = Schema {
            fields: vec![SchemaField {
                name: "order_id".into(),
                field_type: FieldType::Bigint,
            }],
        };
        let body =
            JobSubmitter::request_body(&descriptor, &DelimitedOptions::default(), Some(&schema));
        assert_eq!(
            body["schema"],
            json!({"fields": [{"name": "order_id", "type": "Bigint"}]})
        );
    }
}
