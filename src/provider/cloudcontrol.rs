//! AWS Cloud Control API provider.
//!
//! Every node kind maps onto a CloudFormation resource type. Mutations are
//! asynchronous: the returned progress event is polled through
//! `GetResourceRequestStatus` until it reaches a terminal status or the
//! operation timeout elapses.

use async_trait::async_trait;
use aws_sdk_cloudcontrol::Client;
use aws_sdk_cloudcontrol::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_cloudcontrol::types::ProgressEvent;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ExecutionConfig;
use crate::error::ProviderError;
use crate::graph::{Attributes, ResourceKind};

use super::adapter::{
    DeleteOutcome, ProviderAdapter, ProvisionedResource, ResourceHandle, ResourceRequest,
};
use super::schema::{self, Companion, TargetRegistration};

/// API error codes worth retrying.
const TRANSIENT_API_CODES: &[&str] = &[
    "ThrottlingException",
    "ConcurrentOperationException",
    "ServiceInternalErrorException",
    "NetworkFailureException",
    "NotStabilizedException",
    "HandlerInternalFailureException",
    "InternalFailureException",
];

/// Handler error codes worth retrying.
const TRANSIENT_HANDLER_CODES: &[&str] = &[
    "Throttling",
    "NotStabilized",
    "ServiceInternalError",
    "NetworkFailure",
    "InternalFailure",
    "ResourceConflict",
];

/// Cloud Control provider.
#[derive(Debug, Clone)]
pub struct CloudControlProvider {
    client: Client,
    poll_interval: Duration,
    operation_timeout: Duration,
}

/// Classifies a Cloud Control API error code.
fn classify_api_code(code: Option<&str>, message: String, identifier: &str) -> ProviderError {
    match code {
        Some("ResourceNotFoundException") => ProviderError::NotFound {
            provider_id: identifier.to_string(),
        },
        Some(code) if TRANSIENT_API_CODES.contains(&code) => ProviderError::transient(message),
        _ => ProviderError::fatal(message),
    }
}

/// Classifies the error code of a failed progress event.
fn classify_handler_code(
    code: Option<&str>,
    message: &str,
    identifier: &str,
    retry_after: Option<Duration>,
) -> ProviderError {
    let detail = format!("{}: {message}", code.unwrap_or("HandlerError"));
    match code {
        Some("NotFound") => ProviderError::NotFound {
            provider_id: identifier.to_string(),
        },
        Some(code) if TRANSIENT_HANDLER_CODES.contains(&code) => ProviderError::Transient {
            message: detail,
            retry_after,
        },
        _ => ProviderError::fatal(detail),
    }
}

fn sdk_error<E, R>(err: &SdkError<E, R>, identifier: &str) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(err).to_string();
    if matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    ) {
        return ProviderError::transient(message);
    }
    classify_api_code(err.code(), message, identifier)
}

fn retry_hint(event: &ProgressEvent) -> Option<Duration> {
    let at = event.retry_after()?.secs();
    let wait = at - chrono::Utc::now().timestamp();
    u64::try_from(wait).ok().map(Duration::from_secs)
}

fn is_not_found(err: &ProviderError) -> bool {
    matches!(err, ProviderError::NotFound { .. })
}

impl CloudControlProvider {
    /// Creates a provider from the AWS environment.
    pub async fn new(region: Option<&str>, execution: &ExecutionConfig) -> Self {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), execution)
    }

    /// Creates a provider with an existing client.
    #[must_use]
    pub fn with_client(client: Client, execution: &ExecutionConfig) -> Self {
        Self {
            client,
            poll_interval: execution.poll_interval(),
            operation_timeout: execution.operation_timeout(),
        }
    }

    /// Polls a request until it succeeds or fails, returning the identifier.
    async fn await_request(
        &self,
        initial: Option<ProgressEvent>,
        identifier: &str,
    ) -> Result<String, ProviderError> {
        let deadline = Instant::now() + self.operation_timeout;
        let mut event =
            initial.ok_or_else(|| ProviderError::fatal("Cloud Control returned no progress event"))?;

        loop {
            let status = event.operation_status().map_or("PENDING", |s| s.as_str());
            match status {
                "SUCCESS" => {
                    return Ok(event.identifier().unwrap_or(identifier).to_string());
                }
                "FAILED" | "CANCEL_COMPLETE" => {
                    return Err(classify_handler_code(
                        event.error_code().map(|c| c.as_str()),
                        event.status_message().unwrap_or_default(),
                        event.identifier().unwrap_or(identifier),
                        retry_hint(&event),
                    ));
                }
                _ => {}
            }

            let token = event
                .request_token()
                .ok_or_else(|| ProviderError::fatal("Progress event carries no request token"))?
                .to_string();

            if Instant::now() >= deadline {
                return Err(ProviderError::transient(format!(
                    "Request {token} still {status} after {}s",
                    self.operation_timeout.as_secs()
                )));
            }

            debug!(request = %token, status, "Waiting for Cloud Control request");
            tokio::time::sleep(self.poll_interval).await;

            let output = self
                .client
                .get_resource_request_status()
                .request_token(&token)
                .send()
                .await
                .map_err(|e| sdk_error(&e, identifier))?;
            event = output
                .progress_event()
                .cloned()
                .ok_or_else(|| ProviderError::fatal("Request status carries no progress event"))?;
        }
    }

    async fn get_properties(
        &self,
        type_name: &str,
        identifier: &str,
    ) -> Result<Option<Value>, ProviderError> {
        let result = self
            .client
            .get_resource()
            .type_name(type_name)
            .identifier(identifier)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let err = sdk_error(&err, identifier);
                return if is_not_found(&err) { Ok(None) } else { Err(err) };
            }
        };

        let properties = output
            .resource_description()
            .and_then(|d| d.properties())
            .unwrap_or("{}");
        serde_json::from_str(properties)
            .map(Some)
            .map_err(|e| ProviderError::fatal(format!("Unparseable properties for {identifier}: {e}")))
    }

    async fn create_raw(
        &self,
        type_name: &str,
        desired_state: &Value,
        client_token: &str,
    ) -> Result<String, ProviderError> {
        let output = self
            .client
            .create_resource()
            .type_name(type_name)
            .desired_state(desired_state.to_string())
            .client_token(client_token)
            .send()
            .await
            .map_err(|e| sdk_error(&e, type_name))?;
        self.await_request(output.progress_event().cloned(), "").await
    }

    async fn update_raw(
        &self,
        type_name: &str,
        identifier: &str,
        patch: &Value,
        client_token: &str,
    ) -> Result<(), ProviderError> {
        let output = self
            .client
            .update_resource()
            .type_name(type_name)
            .identifier(identifier)
            .patch_document(patch.to_string())
            .client_token(client_token)
            .send()
            .await
            .map_err(|e| sdk_error(&e, identifier))?;
        self.await_request(output.progress_event().cloned(), identifier)
            .await
            .map(|_| ())
    }

    async fn delete_raw(
        &self,
        type_name: &str,
        identifier: &str,
        client_token: &str,
    ) -> Result<DeleteOutcome, ProviderError> {
        let result = self
            .client
            .delete_resource()
            .type_name(type_name)
            .identifier(identifier)
            .client_token(client_token)
            .send()
            .await;

        let outcome = match result {
            Ok(output) => self.await_request(output.progress_event().cloned(), identifier).await,
            Err(err) => Err(sdk_error(&err, identifier)),
        };

        match outcome {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) if is_not_found(&err) => Ok(DeleteOutcome::NotFound),
            Err(err) => Err(err),
        }
    }

    async fn create_companions(
        &self,
        companions: &[Companion],
        client_token: &str,
    ) -> Result<(), ProviderError> {
        for (i, companion) in companions.iter().enumerate() {
            debug!(type_name = companion.type_name, id = %companion.identifier, "Creating companion resource");
            self.create_raw(
                companion.type_name,
                &companion.desired_state,
                &format!("{client_token}-c{i}"),
            )
            .await?;
        }
        Ok(())
    }

    async fn delete_companions(
        &self,
        companions: &[Companion],
        client_token: &str,
    ) -> Result<(), ProviderError> {
        for (i, companion) in companions.iter().enumerate() {
            let outcome = self
                .delete_raw(
                    companion.type_name,
                    &companion.identifier,
                    &format!("{client_token}-d{i}"),
                )
                .await?;
            debug!(id = %companion.identifier, ?outcome, "Removed companion resource");
        }
        Ok(())
    }

    async fn computed(&self, kind: ResourceKind, identifier: &str) -> Result<Attributes, ProviderError> {
        Ok(self
            .get_properties(schema::type_name(kind), identifier)
            .await?
            .map(|props| schema::computed_attributes(kind, &props))
            .unwrap_or_default())
    }

    /// Creates the companions of a new resource and reads its computed attributes.
    async fn finish_create(
        &self,
        request: &ResourceRequest,
        identifier: &str,
    ) -> Result<Attributes, ProviderError> {
        let companions = schema::companions(request.kind, identifier, &request.attributes);
        self.create_companions(&companions, &request.client_token)
            .await?;
        self.computed(request.kind, identifier).await
    }

    async fn register_target(&self, request: &ResourceRequest) -> Result<ProvisionedResource, ProviderError> {
        let registration = TargetRegistration::from_attributes(&request.attributes)
            .ok_or_else(|| ProviderError::fatal("Attachment requires target_group_arn and target_id"))?;
        let type_name = schema::type_name(ResourceKind::TargetGroup);

        let properties = self
            .get_properties(type_name, &registration.target_group_arn)
            .await?
            .ok_or_else(|| {
                ProviderError::fatal(format!(
                    "Target group {} does not exist",
                    registration.target_group_arn
                ))
            })?;

        if let Some(patch) = registration.register_patch(&properties) {
            self.update_raw(
                type_name,
                &registration.target_group_arn,
                &patch,
                &request.client_token,
            )
            .await?;
        }

        Ok(ProvisionedResource {
            provider_id: registration.identifier(),
            attributes: Attributes::new(),
        })
    }

    async fn deregister_target(
        &self,
        handle: &ResourceHandle,
        client_token: &str,
    ) -> Result<DeleteOutcome, ProviderError> {
        let Some(registration) = TargetRegistration::parse(&handle.provider_id) else {
            return Err(ProviderError::fatal(format!(
                "Malformed attachment id {}",
                handle.provider_id
            )));
        };
        let type_name = schema::type_name(ResourceKind::TargetGroup);

        let Some(properties) = self
            .get_properties(type_name, &registration.target_group_arn)
            .await?
        else {
            return Ok(DeleteOutcome::NotFound);
        };
        let Some(patch) = registration.deregister_patch(&properties) else {
            return Ok(DeleteOutcome::NotFound);
        };

        self.update_raw(type_name, &registration.target_group_arn, &patch, client_token)
            .await?;
        Ok(DeleteOutcome::Deleted)
    }
}

#[async_trait]
impl ProviderAdapter for CloudControlProvider {
    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource, ProviderError> {
        if request.kind == ResourceKind::TargetGroupAttachment {
            return self.register_target(request).await;
        }

        let type_name = schema::type_name(request.kind);
        let desired = schema::desired_state(request.kind, &request.attributes);
        let identifier = self
            .create_raw(type_name, &desired, &request.client_token)
            .await?;
        info!(node = %request.node_id, %identifier, "Created {type_name}");

        match self.finish_create(request, &identifier).await {
            Ok(attributes) => Ok(ProvisionedResource {
                provider_id: identifier,
                attributes,
            }),
            Err(err) => {
                warn!(node = %request.node_id, %identifier, error = %err, "Created resource left unfinished");
                Err(ProviderError::Incomplete {
                    provider_id: identifier,
                    message: err.to_string(),
                })
            }
        }
    }

    async fn read(&self, handle: &ResourceHandle) -> Result<Option<Attributes>, ProviderError> {
        if handle.kind == ResourceKind::TargetGroupAttachment {
            let Some(registration) = TargetRegistration::parse(&handle.provider_id) else {
                return Ok(None);
            };
            let properties = self
                .get_properties(
                    schema::type_name(ResourceKind::TargetGroup),
                    &registration.target_group_arn,
                )
                .await?;
            return Ok(properties
                .filter(|p| registration.is_registered(p))
                .map(|_| Attributes::new()));
        }

        Ok(self
            .get_properties(schema::type_name(handle.kind), &handle.provider_id)
            .await?
            .map(|props| schema::computed_attributes(handle.kind, &props)))
    }

    async fn update(
        &self,
        handle: &ResourceHandle,
        request: &ResourceRequest,
    ) -> Result<Attributes, ProviderError> {
        if handle.kind == ResourceKind::TargetGroupAttachment {
            return Ok(Attributes::new());
        }

        let type_name = schema::type_name(handle.kind);
        let patch = schema::patch_document(handle.kind, &handle.attributes, &request.attributes);
        if patch.as_array().is_some_and(|ops| !ops.is_empty()) {
            self.update_raw(type_name, &handle.provider_id, &patch, &request.client_token)
                .await?;
        }

        let before = schema::companions(handle.kind, &handle.provider_id, &handle.attributes);
        let after = schema::companions(handle.kind, &handle.provider_id, &request.attributes);
        if before != after {
            warn!(node = %handle.node_id, "Recreating companion resources");
            let stale: Vec<_> = before.into_iter().filter(|c| !after.contains(c)).collect();
            let fresh: Vec<_> = after.into_iter().filter(|c| !stale.contains(c)).collect();
            self.delete_companions(&stale, &request.client_token).await?;
            self.create_companions(&fresh, &request.client_token).await?;
        }

        self.computed(handle.kind, &handle.provider_id).await
    }

    async fn delete(
        &self,
        handle: &ResourceHandle,
        client_token: &str,
    ) -> Result<DeleteOutcome, ProviderError> {
        if handle.kind == ResourceKind::TargetGroupAttachment {
            return self.deregister_target(handle, client_token).await;
        }

        let companions = schema::companions(handle.kind, &handle.provider_id, &handle.attributes);
        self.delete_companions(&companions, client_token).await?;

        self.delete_raw(schema::type_name(handle.kind), &handle.provider_id, client_token)
            .await
    }

    fn name(&self) -> &'static str {
        "cloudcontrol"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_code_classification() {
        assert!(classify_api_code(Some("ThrottlingException"), String::from("slow down"), "x").is_transient());
        assert!(!classify_api_code(Some("InvalidRequestException"), String::from("bad"), "x").is_transient());
        assert_eq!(
            classify_api_code(Some("ResourceNotFoundException"), String::new(), "vpc-1"),
            ProviderError::NotFound {
                provider_id: String::from("vpc-1")
            }
        );
        assert!(!classify_api_code(None, String::from("unknown"), "x").is_transient());
    }

    #[test]
    fn test_handler_code_classification() {
        let err = classify_handler_code(
            Some("Throttling"),
            "Rate exceeded",
            "sg-1",
            Some(Duration::from_secs(3)),
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));

        let err = classify_handler_code(Some("InvalidRequest"), "bad CIDR", "", None);
        assert!(err.to_string().contains("InvalidRequest: bad CIDR"));
        assert!(!err.is_transient());

        assert!(is_not_found(&classify_handler_code(Some("NotFound"), "", "i-1", None)));
    }
}
