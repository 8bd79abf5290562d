//! Eligibility, selection and dependency validation over the job collection.
//!
//! Pure functions over a job slice; the scheduler owns the collection and
//! calls these under its lock.

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{Job, JobStatus};

/// Status lookup by job ID.
fn statuses(jobs: &[Job]) -> HashMap<&str, JobStatus> {
    jobs.iter().map(|j| (j.id.as_str(), j.status)).collect()
}

/// Whether `job` may be dispatched at `now` (Unix milliseconds).
///
/// Pending, not held, due, and every dependency completed. A dependency on an
/// unknown job is never satisfied.
fn is_eligible_with(job: &Job, statuses: &HashMap<&str, JobStatus>, now: i64) -> bool {
    job.status == JobStatus::Pending
        && !job.held
        && job.scheduled_at.is_none_or(|at| now >= at)
        && job
            .dependencies
            .iter()
            .all(|dep| statuses.get(dep.as_str()) == Some(&JobStatus::Completed))
}

pub fn is_eligible(job: &Job, jobs: &[Job], now: i64) -> bool {
    is_eligible_with(job, &statuses(jobs), now)
}

/// Index of the next job to dispatch.
///
/// Highest priority first, then earliest creation, then collection order.
pub fn select_next(jobs: &[Job], now: i64) -> Option<usize> {
    let statuses = statuses(jobs);
    let mut best: Option<(usize, &Job)> = None;

    for (idx, job) in jobs.iter().enumerate() {
        if !is_eligible_with(job, &statuses, now) {
            continue;
        }
        let better = best.is_none_or(|(_, current)| {
            job.priority > current.priority
                || (job.priority == current.priority && job.created_at < current.created_at)
        });
        if better {
            best = Some((idx, job));
        }
    }

    best.map(|(idx, _)| idx)
}

/// Move scheduled jobs whose time has come back to pending.
///
/// Returns the indices of promoted jobs.
pub fn promote_due(jobs: &mut [Job], now: i64) -> Vec<usize> {
    let mut promoted = Vec::new();
    for (idx, job) in jobs.iter_mut().enumerate() {
        if job.status == JobStatus::Scheduled && job.scheduled_at.is_none_or(|at| now >= at) {
            job.status = JobStatus::Pending;
            job.updated_at = now;
            promoted.push(idx);
        }
    }
    promoted
}

/// Validate adding the edge `job_id -> dep`.
///
/// Rejects self-dependencies, unknown IDs and edges that would close a cycle.
pub fn validate_dependency(jobs: &[Job], job_id: &str, dep: &str) -> Result<(), String> {
    if job_id == dep {
        return Err("a job cannot depend on itself".to_string());
    }
    if !jobs.iter().any(|j| j.id == dep) {
        return Err(format!("unknown job '{dep}'"));
    }
    if !is_acyclic(jobs, Some((job_id, dep))) {
        return Err(format!("depending on '{dep}' would create a cycle"));
    }
    Ok(())
}

/// Kahn's algorithm over the dependency graph plus an optional extra edge.
///
/// Dependencies on unknown IDs are ignored.
fn is_acyclic(jobs: &[Job], extra: Option<(&str, &str)>) -> bool {
    let known: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = known.iter().map(|id| (*id, 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    let edges = jobs
        .iter()
        .flat_map(|j| j.dependencies.iter().map(move |d| (j.id.as_str(), d.as_str())))
        .chain(extra);
    for (job, dep) in edges {
        if !known.contains(dep) || !known.contains(job) {
            continue;
        }
        dependents.entry(dep).or_default().push(job);
        *in_degree.entry(job).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut processed = 0usize;
    while let Some(id) = queue.pop_front() {
        processed += 1;
        for &next in dependents.get(id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    processed == known.len()
}
