//! Component steps: one step per [`ComponentPlan`], converging its objects in order.

use super::builder::ComponentPlan;
use super::DriverContext;
use crate::controller::error::ReconcilerError;
use crate::controller::steps::{Step, StepOutcome};
use crate::store::ensure;
use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ComponentStep {
    plan: ComponentPlan,
}

impl ComponentStep {
    pub fn new(plan: ComponentPlan) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl Step<DriverContext> for ComponentStep {
    fn name(&self) -> &'static str {
        self.plan.name
    }

    async fn run(&self, ctx: &mut DriverContext) -> Result<StepOutcome, ReconcilerError> {
        let mut writes = 0;
        for desired in &self.plan.objects {
            if ensure(ctx.client.as_ref(), desired.clone()).await?.wrote() {
                writes += 1;
            }
        }
        debug!(component = self.plan.name, writes, "component.converged");
        Ok(StepOutcome::Continue)
    }
}
