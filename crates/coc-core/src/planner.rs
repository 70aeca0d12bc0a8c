//! Directive planner: asks the planner model for a DirectiveSpec.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::domain::DirectiveSpec;
use crate::error::{CocError, Result};
use crate::registry::{ModelRegistry, PickRequest};

/// Role used to resolve the planner model.
pub const PLANNER_ROLE: &str = "planner";

pub struct DirectivePlanner {
    registry: Arc<dyn ModelRegistry>,
    call_timeout: Duration,
}

impl DirectivePlanner {
    pub fn new(registry: Arc<dyn ModelRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            call_timeout,
        }
    }

    /// Expand `directive` into a validated spec.
    ///
    /// Failures here are failures of the whole directive: there is no task
    /// yet to absorb them.
    #[instrument(skip(self, meta, cancel))]
    pub async fn plan(
        &self,
        directive: &str,
        meta: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<DirectiveSpec> {
        let request = PickRequest::for_role(PLANNER_ROLE).with_context("large");
        let planner = self
            .registry
            .pick(&request)
            .map_err(|e| infrastructure(format!("{e:#}")))?;

        let yaml = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CocError::Cancelled),
            res = tokio::time::timeout(self.call_timeout, planner.generate_spec(directive, meta)) => {
                match res {
                    Ok(Ok(yaml)) => yaml,
                    Ok(Err(e)) => return Err(infrastructure(format!("{e:#}"))),
                    Err(_) => return Err(infrastructure(format!(
                        "timed out after {} ms",
                        self.call_timeout.as_millis()
                    ))),
                }
            }
        };

        let spec = DirectiveSpec::from_yaml(&yaml)?;
        info!(model = %planner.name(), tasks = spec.spec.len(), "directive planned");
        Ok(spec)
    }
}

fn infrastructure(detail: String) -> CocError {
    CocError::Infrastructure {
        stage: PLANNER_ROLE.to_string(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedModelRegistry;

    fn planner(registry: ScriptedModelRegistry) -> DirectivePlanner {
        DirectivePlanner::new(Arc::new(registry), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn parses_planner_output() {
        let registry = ScriptedModelRegistry::new()
            .with_plan("spec:\n  - id: a\n    title: Do it\n    role: worker\n");
        let spec = planner(registry.clone())
            .plan("do it", &serde_json::Value::Null, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(spec.spec.len(), 1);
        assert_eq!(registry.plan_count(), 1);
        assert_eq!(registry.picks()[0].role, PLANNER_ROLE);
        assert_eq!(registry.picks()[0].context_hint.as_deref(), Some("large"));
    }

    #[tokio::test]
    async fn invalid_plan_is_rejected() {
        let registry = ScriptedModelRegistry::new()
            .with_plan("spec:\n  - id: a\n    title: Do it\n    role: ''\n");
        let err = planner(registry)
            .plan("do it", &serde_json::Value::Null, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CocError::InvalidSpec(_)));
    }
}
