//! Connected-client bookkeeping and per-round participant selection.
//!
//! Membership may change at any time; a round's participants are the
//! snapshot returned by [`ClientRegistry::select`].

use parking_lot::RwLock;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::ClientProxy;
use crate::error::FlError;
use crate::results::{ClientId, Round};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    /// Fraction of registered clients to sample; `None` selects everyone.
    pub fraction: Option<f64>,
    /// Base seed for reproducible sampling (combined with the round number).
    pub seed: Option<u64>,
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<BTreeMap<ClientId, Arc<dyn ClientProxy>>>,
}

impl ClientRegistry {
    pub fn new() -> Self { Self::default() }

    /// Returns false when the id is already registered; the existing entry is kept.
    pub fn register(&self, client: Arc<dyn ClientProxy>) -> bool {
        let id = client.id().clone();
        let mut map = self.clients.write();
        if map.contains_key(&id) { return false; }
        map.insert(id.clone(), client);
        info!(client = %id, registered = map.len(), "client_registered");
        true
    }

    pub fn unregister(&self, id: &ClientId) -> bool {
        let mut map = self.clients.write();
        let removed = map.remove(id).is_some();
        if removed { info!(client = %id, registered = map.len(), "client_unregistered"); }
        removed
    }

    pub fn len(&self) -> usize { self.clients.read().len() }
    pub fn is_empty(&self) -> bool { self.clients.read().is_empty() }
    pub fn ids(&self) -> Vec<ClientId> { self.clients.read().keys().cloned().collect() }

    pub fn select(&self, round: Round, minimum: usize, policy: &SelectionPolicy) -> Result<Vec<Arc<dyn ClientProxy>>, FlError> {
        let candidates: Vec<Arc<dyn ClientProxy>> = self.clients.read().values().cloned().collect();
        let available = candidates.len();
        if available < minimum || available == 0 {
            return Err(FlError::InsufficientClients { available, required: minimum.max(1) });
        }
        let Some(fraction) = policy.fraction else { return Ok(candidates) };
        let wanted = ((available as f64 * fraction).ceil() as usize).max(minimum).max(1).min(available);
        let mut rng = match policy.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(round)),
            None => StdRng::from_entropy(),
        };
        let picked: Vec<_> = candidates.choose_multiple(&mut rng, wanted).cloned().collect();
        debug!(round, available, wanted, "clients_sampled");
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterSet;
    use crate::results::{EvalResult, FitResult, RoundConfig};
    use async_trait::async_trait;

    struct Idle(ClientId);

    #[async_trait]
    impl ClientProxy for Idle {
        fn id(&self) -> &ClientId { &self.0 }
        async fn get_parameters(&self) -> Result<ParameterSet, FlError> { Ok(ParameterSet::new(vec![])) }
        async fn fit(&self, _p: ParameterSet, _c: RoundConfig) -> Result<FitResult, FlError> { Err(FlError::EmptyAggregation) }
        async fn evaluate(&self, _p: ParameterSet, _c: RoundConfig) -> Result<EvalResult, FlError> { Err(FlError::EmptyAggregation) }
    }

    fn registry(n: usize) -> ClientRegistry {
        let reg = ClientRegistry::new();
        for i in 0..n { reg.register(Arc::new(Idle(ClientId::new(format!("c{i}"))))); }
        reg
    }

    fn ids(sel: &[Arc<dyn ClientProxy>]) -> Vec<ClientId> { sel.iter().map(|c| c.id().clone()).collect() }

    #[test]
    fn selects_everyone_without_fraction() {
        let reg = registry(3);
        let sel = reg.select(1, 2, &SelectionPolicy::default()).unwrap();
        assert_eq!(ids(&sel), reg.ids());
    }

    #[test]
    fn insufficient_clients() {
        let reg = registry(1);
        let err = reg.select(1, 2, &SelectionPolicy::default()).err();
        assert_eq!(err, Some(FlError::InsufficientClients { available: 1, required: 2 }));
        let empty = ClientRegistry::new();
        assert!(empty.select(1, 0, &SelectionPolicy::default()).is_err());
    }

    #[test]
    fn duplicate_ids_refused_and_unregister() {
        let reg = registry(2);
        assert!(!reg.register(Arc::new(Idle(ClientId::new("c0")))));
        assert_eq!(reg.len(), 2);
        assert!(reg.unregister(&ClientId::new("c0")));
        assert!(!reg.unregister(&ClientId::new("c0")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn seeded_sampling_is_reproducible_and_respects_minimum() {
        let reg = registry(10);
        let policy = SelectionPolicy { fraction: Some(0.3), seed: Some(7) };
        let a = ids(&reg.select(4, 2, &policy).unwrap());
        let b = ids(&reg.select(4, 2, &policy).unwrap());
        assert_eq!(a.len(), 3);
        assert_eq!(a, b);

        let tiny = SelectionPolicy { fraction: Some(0.01), seed: Some(7) };
        assert_eq!(reg.select(1, 4, &tiny).unwrap().len(), 4);
    }
}
