use std::sync::Arc;

use factorial::Factorial;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    config::{ExtraCandidates, FitSettings, InitialState, SearchSettings, Selection},
    particle::Candidate,
    result::FitResult,
    solver::fit,
    topology::Topology,
    tree::FitTree,
    uncertainties::UncertaintyModel,
    KinfitError, KinfitResult,
};

/// A quality estimate of a bound, unfitted tree. A score of zero (or less) skips the fit.
pub type Prefilter = Arc<dyn Fn(&FitTree) -> f64 + Send + Sync>;

/// One way of attaching candidates to the leaves of a topology.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    /// Index of the candidate bound to each leaf, by leaf index.
    pub leaves: Vec<usize>,
    /// Candidates which were considered but not bound to any leaf, in increasing order.
    pub unassigned: Vec<usize>,
}

/// Number of injective assignments of `n_candidates` candidates to `n_leaves` leaves,
/// $`n!/(n-k)!`$, or `None` if it overflows.
pub fn naive_count(n_candidates: usize, n_leaves: usize) -> Option<u128> {
    if n_leaves > n_candidates {
        return Some(0);
    }
    let n = (n_candidates as u128).checked_factorial()?;
    let rest = ((n_candidates - n_leaves) as u128).checked_factorial()?;
    Some(n / rest)
}

/// Number of assignments left after removing exchanges within the symmetry groups and subtree
/// symmetries of `topology`, or `None` if it overflows.
pub fn pruned_count(topology: &Topology, n_candidates: usize) -> Option<u128> {
    let naive = naive_count(n_candidates, topology.n_leaves())?;
    let redundancy = topology
        .symmetry_groups()
        .iter()
        .map(Vec::len)
        .chain(topology.subtree_symmetries().iter().map(Vec::len))
        .try_fold(1u128, |acc, size| {
            acc.checked_mul((size as u128).checked_factorial()?)
        })?;
    Some(naive / redundancy)
}

/// All assignments of candidates to the leaves of `topology` which are distinct up to exchanges
/// within symmetry groups and of whole symmetric sub-trees, in lexicographic order.
///
/// Of every set of assignments related by such exchanges only the one whose candidate indices
/// increase along each of [`Topology::ordering_chains`] is kept.
pub fn enumerate_assignments(
    topology: &Topology,
    n_candidates: usize,
    extra: ExtraCandidates,
) -> Vec<Assignment> {
    let n_leaves = topology.n_leaves();
    if n_candidates < n_leaves {
        return Vec::new();
    }
    let pool = match extra {
        ExtraCandidates::Discard => n_leaves,
        ExtraCandidates::Enumerate => n_candidates,
    };
    // the leaves which must hold a smaller candidate than a given leaf
    let mut predecessors = vec![Vec::new(); n_leaves];
    for chain in topology.ordering_chains() {
        for pair in chain.windows(2) {
            predecessors[pair[1]].push(pair[0]);
        }
    }
    let mut assignments = Vec::new();
    let mut current = Vec::with_capacity(n_leaves);
    let mut used = vec![false; pool];
    extend(
        &predecessors,
        n_leaves,
        &mut current,
        &mut used,
        &mut assignments,
    );
    assignments
}

fn extend(
    predecessors: &[Vec<usize>],
    n_leaves: usize,
    current: &mut Vec<usize>,
    used: &mut [bool],
    out: &mut Vec<Assignment>,
) {
    let leaf = current.len();
    if leaf == n_leaves {
        out.push(Assignment {
            leaves: current.clone(),
            unassigned: (0..used.len()).filter(|&i| !used[i]).collect(),
        });
        return;
    }
    let lowest = predecessors[leaf]
        .iter()
        .map(|&p| current[p] + 1)
        .max()
        .unwrap_or(0);
    for candidate in lowest..used.len() {
        if used[candidate] {
            continue;
        }
        used[candidate] = true;
        current.push(candidate);
        extend(predecessors, n_leaves, current, used, out);
        current.pop();
        used[candidate] = false;
    }
}

/// The fit of one assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermutationFit {
    pub assignment: Assignment,
    pub result: FitResult,
}

/// An assignment which could not be fitted because the uncertainty model did not cover one of
/// its candidates.
#[derive(Clone, Debug)]
pub struct AbortedFit {
    pub assignment: Assignment,
    pub error: KinfitError,
}

/// Everything a [`PermutationSearch`] found for one event.
#[derive(Clone, Debug, Default)]
pub struct SearchReport {
    /// Fits ranked best first (see [`FitResult::ranking`]), trimmed by the search's
    /// [`Selection`].
    pub fits: Vec<PermutationFit>,
    /// Assignments dropped before fitting.
    pub aborted: Vec<AbortedFit>,
    /// Number of distinct assignments enumerated.
    pub attempted: usize,
    /// Number of assignments which went through the solver.
    pub solver_runs: usize,
}

impl SearchReport {
    /// The best-ranked fit, if any.
    pub fn best(&self) -> Option<&PermutationFit> {
        self.fits.first()
    }
    pub fn ranked(&self) -> &[PermutationFit] {
        &self.fits
    }
    pub fn into_ranked(self) -> Vec<PermutationFit> {
        self.fits
    }
}

/// Fits every distinct assignment of an event's candidates to a topology and ranks the results.
///
/// All assignments are bound before the first fit, so configuration problems surface as errors
/// without any solver work. Fits run in parallel with the `rayon` feature, and the report is
/// independent of scheduling.
///
/// A search is meant to be set up once and run on many events: a dedicated thread pool requested
/// through [`SearchSettings::threads`] is built by
/// [`PermutationSearch::with_search_settings`] and shared by every run and every clone.
#[derive(Clone)]
pub struct PermutationSearch {
    topology: Arc<Topology>,
    initial: InitialState,
    model: Box<dyn UncertaintyModel>,
    fit_settings: FitSettings,
    search_settings: SearchSettings,
    prefilter: Option<(Prefilter, Option<usize>)>,
    #[cfg(feature = "rayon")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl PermutationSearch {
    pub fn new(
        topology: Arc<Topology>,
        initial: InitialState,
        model: Box<dyn UncertaintyModel>,
    ) -> Self {
        tracing::info!(
            topology = topology.name(),
            leaves = topology.n_leaves(),
            symmetry_groups = topology.symmetry_groups().len(),
            "set up permutation search"
        );
        Self {
            topology,
            initial,
            model,
            fit_settings: FitSettings::default(),
            search_settings: SearchSettings::default(),
            prefilter: None,
            #[cfg(feature = "rayon")]
            pool: None,
        }
    }
    pub fn with_fit_settings(mut self, settings: FitSettings) -> Self {
        self.fit_settings = settings;
        self
    }
    /// Apply `settings`, building the dedicated thread pool they ask for.
    ///
    /// # Errors
    ///
    /// Returns [`KinfitError::Custom`] for a pool of zero threads, or for more than one thread
    /// without the `rayon` feature, and [`KinfitError::ThreadPoolError`] if the pool cannot be
    /// built.
    pub fn with_search_settings(mut self, settings: SearchSettings) -> KinfitResult<Self> {
        match settings.threads {
            Some(0) => {
                return Err(KinfitError::Custom(
                    "a dedicated thread pool needs at least one thread".to_string(),
                ))
            }
            #[cfg(not(feature = "rayon"))]
            Some(threads) if threads > 1 => {
                return Err(KinfitError::Custom(
                    "the rayon feature is required for more than one thread".to_string(),
                ))
            }
            _ => {}
        }
        #[cfg(feature = "rayon")]
        {
            self.pool = match settings.threads {
                Some(threads) => Some(Arc::new(
                    rayon::ThreadPoolBuilder::new()
                        .num_threads(threads)
                        .build()?,
                )),
                None => None,
            };
            tracing::debug!(threads = ?settings.threads, "configured search thread pool");
        }
        self.search_settings = settings;
        Ok(self)
    }
    /// Score each bound tree with `prefilter` before fitting. Trees scoring zero are skipped, and
    /// if `keep` is given only that many of the best-scoring trees are fitted.
    pub fn with_prefilter(mut self, prefilter: Prefilter, keep: Option<usize>) -> Self {
        self.prefilter = Some((prefilter, keep));
        self
    }
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }
    pub fn fit_settings(&self) -> &FitSettings {
        &self.fit_settings
    }
    pub fn search_settings(&self) -> &SearchSettings {
        &self.search_settings
    }

    /// Fit the candidates of one event at the given beam energy.
    ///
    /// With fewer candidates than leaves the report holds a single
    /// [`FitStatus::InsufficientInput`](crate::result::FitStatus::InsufficientInput) result and
    /// nothing is fitted.
    ///
    /// # Errors
    ///
    /// Binding errors other than [`KinfitError::UnmodeledUncertainty`] are returned before any
    /// fit runs.
    pub fn run(&self, beam_energy: f64, candidates: &[Candidate]) -> KinfitResult<SearchReport> {
        let n_leaves = self.topology.n_leaves();
        if candidates.len() < n_leaves {
            tracing::debug!(
                candidates = candidates.len(),
                leaves = n_leaves,
                "not enough candidates"
            );
            return Ok(SearchReport {
                fits: vec![PermutationFit {
                    assignment: Assignment::default(),
                    result: FitResult::insufficient_input(),
                }],
                ..Default::default()
            });
        }
        let assignments = enumerate_assignments(
            &self.topology,
            candidates.len(),
            self.search_settings.extra_candidates,
        );
        let attempted = assignments.len();
        let mut aborted = Vec::new();
        let mut bound = Vec::with_capacity(attempted);
        for assignment in assignments {
            match FitTree::bind(
                self.topology.clone(),
                &self.initial,
                beam_energy,
                candidates,
                &assignment.leaves,
                self.model.as_ref(),
                &self.fit_settings,
            ) {
                Ok(tree) => bound.push((assignment, tree)),
                Err(error @ KinfitError::UnmodeledUncertainty { .. }) => {
                    tracing::warn!(
                        assignment = ?assignment.leaves,
                        %error,
                        "dropping permutation"
                    );
                    aborted.push(AbortedFit { assignment, error });
                }
                Err(error) => return Err(error),
            }
        }
        if let Some((prefilter, keep)) = &self.prefilter {
            let mut scored: Vec<(f64, (Assignment, FitTree))> = bound
                .into_iter()
                .map(|entry| (prefilter(&entry.1), entry))
                .filter(|(score, _)| *score > 0.0)
                .collect();
            // stable, so equal scores keep the enumeration order
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            if let Some(keep) = keep {
                scored.truncate(*keep);
            }
            bound = scored.into_iter().map(|(_, entry)| entry).collect();
        }
        let solver_runs = bound.len();
        let mut fits = self.fit_all(bound);
        fits.sort_by(|a, b| a.result.ranking(&b.result));
        if self.search_settings.selection == Selection::Best {
            fits.truncate(1);
        }
        tracing::debug!(
            attempted,
            solver_runs,
            aborted = aborted.len(),
            converged = fits.iter().filter(|f| f.result.is_converged()).count(),
            "permutation search finished"
        );
        Ok(SearchReport {
            fits,
            aborted,
            attempted,
            solver_runs,
        })
    }

    fn fit_one(&self, assignment: Assignment, tree: FitTree) -> PermutationFit {
        let result = fit(tree, &self.fit_settings);
        tracing::debug!(
            assignment = ?assignment.leaves,
            status = %result.status,
            chi2 = result.chi2,
            iterations = result.iterations,
            "fitted permutation"
        );
        PermutationFit { assignment, result }
    }

    #[cfg(feature = "rayon")]
    fn fit_all(&self, bound: Vec<(Assignment, FitTree)>) -> Vec<PermutationFit> {
        let fit_in_pool = || -> Vec<PermutationFit> {
            bound
                .into_par_iter()
                .map(|(assignment, tree)| self.fit_one(assignment, tree))
                .collect()
        };
        match &self.pool {
            Some(pool) => pool.install(fit_in_pool),
            None => fit_in_pool(),
        }
    }

    #[cfg(not(feature = "rayon"))]
    fn fit_all(&self, bound: Vec<(Assignment, FitTree)>) -> Vec<PermutationFit> {
        bound
            .into_iter()
            .map(|(assignment, tree)| self.fit_one(assignment, tree))
            .collect()
    }
}
