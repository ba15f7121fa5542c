//! Resolution of the consumer key for the current working context.

use crate::slot::ConsumerKey;

#[derive(Debug, thiserror::Error)]
#[error("could not determine consumer key: {0}")]
pub struct ResolveError(pub String);

/// Works out which (project, branch) the caller is acting for.
///
/// Branch and project detection live outside this crate; anything that can
/// name the current consumer plugs in here.
pub trait ConsumerKeyResolver: Send + Sync {
    fn current_consumer_key(&self) -> Result<ConsumerKey, ResolveError>;
}

/// Resolver that always answers with the same key.
#[derive(Debug, Clone)]
pub struct FixedConsumerKey(pub ConsumerKey);

impl ConsumerKeyResolver for FixedConsumerKey {
    fn current_consumer_key(&self) -> Result<ConsumerKey, ResolveError> {
        Ok(self.0.clone())
    }
}
