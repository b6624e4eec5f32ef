/// Multi-server fan-out for administrative commands
///
/// Each server's outcome is captured in its own slot; one server failing never
/// cancels or short-circuits its siblings. The aggregate is only handed out once
/// every targeted server has resolved.
use crate::core::pool::ConnectionPool;
use crate::core::ServerSpec;
use crate::error::{AlacenaError, AlacenaResult};
use crate::protocol::{Command, Reply};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::hash_map;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Progress of a fan-out call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Initiated,
    Awaiting(usize),
    Complete,
}

/// Per-server results of a fan-out call
#[derive(Debug)]
pub struct Aggregate<T> {
    results: HashMap<ServerSpec, AlacenaResult<T>>,
}

/// Statistics from every server, keyed by server
pub type StatsAggregate = Aggregate<HashMap<String, String>>;

impl<T> Aggregate<T> {
    pub fn get(&self, server: &ServerSpec) -> Option<&AlacenaResult<T>> {
        self.results.get(server)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, ServerSpec, AlacenaResult<T>> {
        self.results.iter()
    }

    /// Servers that answered
    pub fn successes(&self) -> impl Iterator<Item = (&ServerSpec, &T)> {
        self.results
            .iter()
            .filter_map(|(server, result)| result.as_ref().ok().map(|value| (server, value)))
    }

    /// Servers marked with an error
    pub fn failures(&self) -> impl Iterator<Item = (&ServerSpec, &AlacenaError)> {
        self.results
            .iter()
            .filter_map(|(server, result)| result.as_ref().err().map(|error| (server, error)))
    }

    pub fn into_inner(self) -> HashMap<ServerSpec, AlacenaResult<T>> {
        self.results
    }
}

impl<T> IntoIterator for Aggregate<T> {
    type Item = (ServerSpec, AlacenaResult<T>);
    type IntoIter = hash_map::IntoIter<ServerSpec, AlacenaResult<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

/// Accumulates results until every targeted server has reported
#[derive(Debug)]
pub(crate) struct Batch<T> {
    state: BatchState,
    results: HashMap<ServerSpec, AlacenaResult<T>>,
}

impl<T> Batch<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: BatchState::Initiated,
            results: HashMap::new(),
        }
    }

    pub(crate) fn state(&self) -> BatchState {
        self.state
    }

    pub(crate) fn begin(&mut self, outstanding: usize) {
        self.state = if outstanding == 0 {
            BatchState::Complete
        } else {
            BatchState::Awaiting(outstanding)
        };
    }

    pub(crate) fn record(&mut self, server: ServerSpec, outcome: AlacenaResult<T>) {
        if let BatchState::Awaiting(outstanding) = self.state {
            self.results.insert(server, outcome);
            self.state = match outstanding - 1 {
                0 => BatchState::Complete,
                left => BatchState::Awaiting(left),
            };
        }
    }

    /// The aggregate, only once every server resolved
    pub(crate) fn finish(self) -> Option<Aggregate<T>> {
        match self.state {
            BatchState::Complete => Some(Aggregate {
                results: self.results,
            }),
            _ => None,
        }
    }
}

/// Send `command` to every configured server and collect each outcome
pub(crate) async fn fan_out<T, F>(
    pool: &ConnectionPool,
    command: Command,
    extract: F,
) -> AlacenaResult<Aggregate<T>>
where
    F: Fn(Reply) -> AlacenaResult<T>,
{
    let servers = pool.servers();
    let mut batch = Batch::new();
    batch.begin(servers.len());
    debug!(command = %command.kind(), servers = servers.len(), "fanning out");

    let command = &command;
    let extract = &extract;
    let mut outstanding: FuturesUnordered<_> = servers
        .iter()
        .map(|server| async move {
            let outcome = match pool.get_or_connect(server).await {
                Ok(connection) => connection.submit(command).await.and_then(extract),
                Err(e) => Err(e),
            };
            (server.clone(), outcome)
        })
        .collect();

    while let Some((server, outcome)) = outstanding.next().await {
        if let Err(e) = &outcome {
            warn!(server = %server, "{} failed: {}", command.kind(), e);
        }
        batch.record(server.clone(), outcome);
        debug!(server = %server, state = ?batch.state(), "fan-out slot resolved");
    }
    batch.finish().ok_or(AlacenaError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_state_machine() {
        let a = ServerSpec::new("a", 11211);
        let b = ServerSpec::new("b", 11211);

        let mut batch: Batch<u32> = Batch::new();
        assert_eq!(batch.state(), BatchState::Initiated);
        batch.begin(2);
        assert_eq!(batch.state(), BatchState::Awaiting(2));

        batch.record(a.clone(), Ok(1));
        assert_eq!(batch.state(), BatchState::Awaiting(1));
        batch.record(b.clone(), Err(AlacenaError::connect(&b, "refused")));
        assert_eq!(batch.state(), BatchState::Complete);

        let aggregate = batch.finish().unwrap();
        assert_eq!(aggregate.len(), 2);
        assert_eq!(aggregate.successes().count(), 1);
        assert_eq!(aggregate.failures().next().unwrap().0, &b);
    }

    #[test]
    fn test_no_partial_result_before_complete() {
        let mut batch: Batch<u32> = Batch::new();
        batch.begin(3);
        batch.record(ServerSpec::new("a", 1), Ok(1));
        assert!(batch.finish().is_none());
    }

    #[test]
    fn test_empty_batch_completes_immediately() {
        let mut batch: Batch<u32> = Batch::new();
        batch.begin(0);
        assert!(batch.finish().unwrap().is_empty());
    }
}
