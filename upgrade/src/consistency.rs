//! Assert that every node of a cohort reports the same state.

use crate::Error;
use futures::future::try_join_all;
use sequencer_harness_client::{self as client, Node};
use std::{collections::BTreeSet, fmt::Debug, future::Future};
use tracing::debug;

/// Values observed across a cohort, compared against the first node's observation.
#[derive(Clone, Debug)]
pub struct CohortState<T> {
    /// Value reported by the first node.
    pub reference: T,

    /// Name of the first node.
    pub reference_node: String,

    /// Every observation, in cohort order.
    pub observations: Vec<(String, T)>,

    /// Names of the nodes whose observation differs from `reference`.
    pub mismatches: BTreeSet<String>,
}

impl<T: PartialEq + Debug> CohortState<T> {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Returns the agreed value, or an error naming the first divergent node.
    pub fn into_consistent(self, what: &str) -> Result<T, Error> {
        let divergent = self
            .observations
            .iter()
            .find(|(_, value)| *value != self.reference);
        if let Some((node, actual)) = divergent {
            return Err(Error::Inconsistent {
                what: what.to_string(),
                reference: self.reference_node.clone(),
                node: node.clone(),
                expected: format!("{:?}", self.reference),
                actual: format!("{actual:?}"),
            });
        }
        Ok(self.reference)
    }
}

/// Queries every node of `cohort` concurrently with `accessor`.
///
/// Any query error aborts the observation.
pub async fn observe<'a, N, T, F, Fut>(
    cohort: &'a [N],
    accessor: F,
) -> Result<CohortState<T>, Error>
where
    N: Node,
    T: Clone + PartialEq,
    F: Fn(&'a N) -> Fut,
    Fut: Future<Output = Result<T, client::Error>>,
{
    let values = try_join_all(cohort.iter().map(&accessor)).await?;
    let observations: Vec<(String, T)> = cohort
        .iter()
        .map(|node| node.name().to_string())
        .zip(values)
        .collect();
    let Some((reference_node, reference)) = observations.first().cloned() else {
        return Err(Error::EmptyCohort);
    };
    let mismatches = observations
        .iter()
        .filter(|(_, value)| *value != reference)
        .map(|(node, _)| node.clone())
        .collect();
    Ok(CohortState {
        reference,
        reference_node,
        observations,
        mismatches,
    })
}

/// Returns the value every node of `cohort` reports for `what`.
///
/// Fails with [Error::Inconsistent] if any node disagrees with the first.
pub async fn ensure_consistent<'a, N, T, F, Fut>(
    what: &str,
    cohort: &'a [N],
    accessor: F,
) -> Result<T, Error>
where
    N: Node,
    T: Clone + PartialEq + Debug,
    F: Fn(&'a N) -> Fut,
    Fut: Future<Output = Result<T, client::Error>>,
{
    let state = observe(cohort, accessor).await?;
    debug!(
        what,
        nodes = state.observations.len(),
        mismatches = ?state.mismatches,
        "observed cohort"
    );
    state.into_consistent(what)
}
