//! Load-balanced connection sets.
//!
//! A program executes against a set of interchangeable physical connections.
//! Single executions pick one member per call — weighted round-robin over an
//! atomic cursor — while broadcast executions iterate every member.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::driver::{Driver, DriverConn, DriverError};

/// Errors opening a connection set.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("a load-balanced set requires at least one endpoint")]
    EmptySet,

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// The configured identity of one physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub dsn: String,
    /// Relative share of single executions routed here; clamped to at
    /// least 1.
    pub weight: u32,
}

impl Endpoint {
    /// Creates an endpoint with weight 1.
    pub fn new(id: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dsn: dsn.into(),
            weight: 1,
        }
    }

    /// Sets the endpoint's weight.
    #[must_use]
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// One open member of a set.
pub struct Member {
    endpoint: Endpoint,
    pub(crate) conn: Arc<dyn DriverConn>,
}

impl Member {
    /// The endpoint this member was opened from.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// A set of interchangeable open connections.
///
/// A member with weight `w` occupies `w` consecutive slots of the
/// round-robin cycle.
pub struct LoadBalancedSet {
    members: Vec<Member>,
    schedule: Vec<usize>,
    cursor: AtomicUsize,
}

impl LoadBalancedSet {
    /// Opens every endpoint through `driver`, in order.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::EmptySet`] when no endpoints are given;
    /// [`ConnectionError::Driver`] when any endpoint fails to connect.
    pub async fn connect(
        driver: &dyn Driver,
        endpoints: Vec<Endpoint>,
    ) -> Result<Self, ConnectionError> {
        if endpoints.is_empty() {
            return Err(ConnectionError::EmptySet);
        }

        let mut members = Vec::with_capacity(endpoints.len());
        let mut schedule = Vec::new();
        for endpoint in endpoints {
            let conn: Arc<dyn DriverConn> = Arc::from(driver.connect(&endpoint.dsn).await?);
            debug!(endpoint = %endpoint.id, "connection opened");
            for _ in 0..endpoint.weight.max(1) {
                schedule.push(members.len());
            }
            members.push(Member { endpoint, conn });
        }

        Ok(Self {
            members,
            schedule,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Selects the member for the next single execution.
    pub fn pick(&self) -> &Member {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.schedule.len();
        &self.members[self.schedule[slot]]
    }

    /// Every member, in endpoint declaration order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if the set has no members (never the case for a
    /// connected set).
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;

    #[tokio::test]
    async fn empty_endpoint_list_is_rejected() {
        let driver = MemoryDriver::new();
        assert!(matches!(
            LoadBalancedSet::connect(&driver, Vec::new()).await,
            Err(ConnectionError::EmptySet)
        ));
    }

    #[tokio::test]
    async fn weighted_round_robin_order() {
        let driver = MemoryDriver::new();
        let set = LoadBalancedSet::connect(
            &driver,
            vec![
                Endpoint::new("a", "mem://a").weight(2),
                Endpoint::new("b", "mem://b"),
            ],
        )
        .await
        .unwrap();

        let picks: Vec<_> = (0..6).map(|_| set.pick().endpoint().id.clone()).collect();
        assert_eq!(picks, ["a", "a", "b", "a", "a", "b"]);
    }

    #[tokio::test]
    async fn zero_weight_is_clamped() {
        let driver = MemoryDriver::new();
        let set = LoadBalancedSet::connect(
            &driver,
            vec![Endpoint::new("only", "mem://only").weight(0)],
        )
        .await
        .unwrap();
        assert_eq!(set.pick().endpoint().id, "only");
    }

    #[tokio::test]
    async fn connect_failure_propagates() {
        let driver = MemoryDriver::new();
        let result = LoadBalancedSet::connect(&driver, vec![Endpoint::new("bad", "")]).await;
        assert!(matches!(result, Err(ConnectionError::Driver(_))));
    }
}
