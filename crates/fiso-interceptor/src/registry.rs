//! Per-target interceptor registry (§4.6): maps a target name to its
//! outbound and inbound chains.

use std::collections::HashMap;
use std::sync::Arc;

use fiso_core::contracts::InterceptorRequest;
use fiso_core::error::FisoError;

use crate::chain::Chain;

#[derive(Clone, Default)]
struct TargetChains {
    outbound: Chain,
    inbound: Chain,
}

/// Holds the outbound/inbound chain pair for every target. Reloading
/// closes the chains being replaced before installing new ones, so a
/// sandbox is never orphaned.
#[derive(Clone, Default)]
pub struct InterceptorRegistry {
    targets: Arc<std::sync::RwLock<HashMap<String, TargetChains>>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target_name: &str, outbound: Chain, inbound: Chain) {
        self.targets
            .write()
            .unwrap()
            .insert(target_name.to_string(), TargetChains { outbound, inbound });
    }

    /// Replaces the entire registry, closing every chain currently
    /// installed first.
    pub async fn replace(&self, new_targets: HashMap<String, (Chain, Chain)>) -> Result<(), FisoError> {
        let old = {
            let mut guard = self.targets.write().unwrap();
            std::mem::replace(
                &mut *guard,
                new_targets
                    .into_iter()
                    .map(|(name, (outbound, inbound))| (name, TargetChains { outbound, inbound }))
                    .collect(),
            )
        };

        let mut first_err = None;
        for (_, chains) in old {
            if let Err(e) = chains.outbound.close().await {
                first_err.get_or_insert(e);
            }
            if let Err(e) = chains.inbound.close().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the request unchanged when the target has no registered
    /// chain or an empty outbound chain.
    pub async fn process_outbound(
        &self,
        target_name: &str,
        request: InterceptorRequest,
    ) -> Result<InterceptorRequest, FisoError> {
        let chain = self
            .targets
            .read()
            .unwrap()
            .get(target_name)
            .map(|c| c.outbound.clone());
        match chain {
            Some(chain) if !chain.is_empty() => chain.run(request).await,
            _ => Ok(request),
        }
    }

    pub async fn process_inbound(
        &self,
        target_name: &str,
        request: InterceptorRequest,
    ) -> Result<InterceptorRequest, FisoError> {
        let chain = self
            .targets
            .read()
            .unwrap()
            .get(target_name)
            .map(|c| c.inbound.clone());
        match chain {
            Some(chain) if !chain.is_empty() => chain.run(request).await,
            _ => Ok(request),
        }
    }
}
