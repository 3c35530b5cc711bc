//! Static conflict scan over a migration set.
//!
//! The scan reads the migration directory, the applied history and the stored
//! checksums, and reports problems that make automatic application unsafe.
//! Each conflict carries a deterministic [`Resolution`] so an operator sees the
//! same remediation steps for the same input every time.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checksum::{ChecksumRecord, ChecksumRepository};
use crate::error::MigrateResult;
use crate::file::{MigrationEntry, MigrationFileManager, MigrationScript};
use crate::history::{MigrationHistoryRepository, MigrationRecord};

/// Kind of conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Two or more files share a timestamp prefix.
    DuplicateTimestamp,
    /// An unapplied file is older than the latest applied migration.
    OutOfOrder,
    /// A `@depends` target is not in the set.
    MissingDependency,
    /// Dependencies form a cycle.
    CircularDependency,
    /// An applied file was edited after it ran.
    ChecksumMismatch,
    /// A `.sql` file does not follow the naming convention.
    InvalidFileName,
    /// An unapplied script has no DOWN companion.
    MissingRollback,
}

/// How serious a conflict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// May proceed after operator acknowledgement.
    Warning,
    /// Blocks automatic application.
    Error,
    /// Blocks automatic application; indicates tampering.
    Critical,
}

/// Remediation approach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Give a file a new name or timestamp.
    Rename,
    /// Change the order scripts run in.
    Reorder,
    /// An operator has to decide.
    Manual,
}

/// Suggested remediation for a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Approach.
    pub strategy: ResolutionStrategy,
    /// One-line description.
    pub description: String,
    /// Ordered steps.
    pub steps: Vec<String>,
}

/// One detected conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Kind of conflict.
    pub conflict_type: ConflictType,
    /// Severity.
    pub severity: Severity,
    /// Human-readable description.
    pub description: String,
    /// Files or migration IDs involved, sorted.
    pub affected_objects: Vec<String>,
    /// Suggested remediation.
    pub resolution: Resolution,
}

impl Conflict {
    /// Whether this conflict blocks automatic application.
    pub fn is_blocking(&self) -> bool {
        self.severity >= Severity::Error
    }
}

/// Outcome of a conflict scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Conflicts in deterministic order.
    pub conflicts: Vec<Conflict>,
}

impl ConflictReport {
    /// Whether nothing was found.
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// True when any Error or Critical conflict exists.
    pub fn blocks_apply(&self) -> bool {
        self.conflicts.iter().any(Conflict::is_blocking)
    }

    /// True when only Warnings exist.
    pub fn requires_acknowledgement(&self) -> bool {
        !self.blocks_apply() && !self.conflicts.is_empty()
    }

    /// Conflicts of one kind.
    pub fn of_type(&self, conflict_type: ConflictType) -> impl Iterator<Item = &Conflict> {
        self.conflicts
            .iter()
            .filter(move |c| c.conflict_type == conflict_type)
    }

    /// Number of blocking conflicts.
    pub fn blocking_count(&self) -> usize {
        self.conflicts.iter().filter(|c| c.is_blocking()).count()
    }

    /// Get a summary of the report.
    pub fn summary(&self) -> String {
        if self.conflicts.is_empty() {
            return "No conflicts".to_string();
        }
        let mut counts: BTreeMap<Severity, usize> = BTreeMap::new();
        for conflict in &self.conflicts {
            *counts.entry(conflict.severity).or_default() += 1;
        }
        counts
            .iter()
            .rev()
            .map(|(severity, n)| format!("{} {:?}", n, severity).to_lowercase())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Detects conflicts in a migration set.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Scan the directory, history and checksum store.
    pub async fn scan<H, C>(
        files: &MigrationFileManager,
        history: &H,
        checksums: &C,
    ) -> MigrateResult<ConflictReport>
    where
        H: MigrationHistoryRepository + ?Sized,
        C: ChecksumRepository + ?Sized,
    {
        let entries = files.list_entries().await?;
        let scripts = files.list_scripts().await?;
        let applied = history.get_applied().await?;
        let stored = checksums.all().await?;

        let report = Self::detect(&entries, &scripts, &applied, &stored);
        if report.is_empty() {
            debug!(scripts = scripts.len(), "No migration conflicts");
        } else {
            warn!(
                conflicts = report.conflicts.len(),
                blocking = report.blocking_count(),
                "Migration conflicts detected"
            );
        }
        Ok(report)
    }

    /// Pure conflict detection over already-loaded inputs.
    pub fn detect(
        entries: &[MigrationEntry],
        scripts: &[MigrationScript],
        applied: &[MigrationRecord],
        stored: &[ChecksumRecord],
    ) -> ConflictReport {
        let applied_ids: HashSet<&str> = applied.iter().map(|r| r.id.as_str()).collect();
        let mut conflicts = Vec::new();

        duplicate_timestamps(scripts, &applied_ids, &mut conflicts);
        out_of_order(scripts, applied, &applied_ids, &mut conflicts);
        missing_dependencies(scripts, &mut conflicts);
        circular_dependencies(scripts, &mut conflicts);
        checksum_mismatches(scripts, applied, stored, &mut conflicts);
        invalid_file_names(entries, &mut conflicts);
        missing_rollbacks(scripts, &applied_ids, &mut conflicts);

        conflicts.sort_by(|a, b| {
            a.conflict_type
                .cmp(&b.conflict_type)
                .then_with(|| a.affected_objects.cmp(&b.affected_objects))
        });
        ConflictReport { conflicts }
    }
}

fn file_name(script: &MigrationScript) -> String {
    format!("{}.sql", script.id)
}

fn duplicate_timestamps(
    scripts: &[MigrationScript],
    applied: &HashSet<&str>,
    out: &mut Vec<Conflict>,
) {
    let mut by_version: BTreeMap<&str, Vec<&MigrationScript>> = BTreeMap::new();
    for script in scripts {
        by_version.entry(&script.version).or_default().push(script);
    }

    for (version, group) in by_version {
        if group.len() < 2 {
            continue;
        }
        let mut names: Vec<String> = group.iter().map(|s| file_name(s)).collect();
        names.sort();

        let keep = group
            .iter()
            .filter(|s| applied.contains(s.id.as_str()))
            .map(|s| file_name(s))
            .min()
            .unwrap_or_else(|| names[0].clone());

        let mut steps = vec![format!("Keep {} unchanged", keep)];
        for name in names.iter().filter(|n| **n != keep) {
            steps.push(format!("Rename {} to an unused timestamp prefix", name));
        }
        steps.push("Update any @depends annotations that reference renamed files".to_string());

        out.push(Conflict {
            conflict_type: ConflictType::DuplicateTimestamp,
            severity: Severity::Error,
            description: format!("{} files share timestamp {}", names.len(), version),
            affected_objects: names,
            resolution: Resolution {
                strategy: ResolutionStrategy::Rename,
                description: format!("Give every migration with timestamp {} a unique prefix", version),
                steps,
            },
        });
    }
}

fn out_of_order(
    scripts: &[MigrationScript],
    applied: &[MigrationRecord],
    applied_ids: &HashSet<&str>,
    out: &mut Vec<Conflict>,
) {
    let Some(latest) = applied.iter().map(|r| r.version()).max() else {
        return;
    };

    for script in scripts {
        if applied_ids.contains(script.id.as_str()) || script.version.as_str() >= latest {
            continue;
        }
        out.push(Conflict {
            conflict_type: ConflictType::OutOfOrder,
            severity: Severity::Warning,
            description: format!(
                "{} is older than the latest applied migration ({}) but has not been applied",
                script.id, latest
            ),
            affected_objects: vec![file_name(script)],
            resolution: Resolution {
                strategy: ResolutionStrategy::Reorder,
                description: format!("Move {} after {}", script.id, latest),
                steps: vec![
                    format!(
                        "Rename {} with a timestamp later than {}",
                        file_name(script),
                        latest
                    ),
                    "Or review it against the current schema and acknowledge out-of-order application"
                        .to_string(),
                ],
            },
        });
    }
}

fn resolves(scripts: &[MigrationScript], dependency: &str) -> Option<usize> {
    scripts
        .iter()
        .position(|s| s.id == dependency || s.version == dependency)
}

fn missing_dependencies(scripts: &[MigrationScript], out: &mut Vec<Conflict>) {
    for script in scripts {
        for dependency in &script.depends_on {
            if resolves(scripts, dependency).is_some() {
                continue;
            }
            out.push(Conflict {
                conflict_type: ConflictType::MissingDependency,
                severity: Severity::Error,
                description: format!("{} depends on {}, which does not exist", script.id, dependency),
                affected_objects: vec![file_name(script), dependency.clone()],
                resolution: Resolution {
                    strategy: ResolutionStrategy::Manual,
                    description: format!("Provide {} or drop the dependency", dependency),
                    steps: vec![
                        format!("Add the migration {} to the migrations directory", dependency),
                        format!(
                            "Or remove '-- @depends: {}' from {}",
                            dependency,
                            file_name(script)
                        ),
                    ],
                },
            });
        }
    }
}

fn circular_dependencies(scripts: &[MigrationScript], out: &mut Vec<Conflict>) {
    let edges: Vec<Vec<usize>> = scripts
        .iter()
        .map(|s| {
            let mut targets: Vec<usize> = s
                .depends_on
                .iter()
                .filter_map(|d| resolves(scripts, d))
                .collect();
            targets.sort_unstable();
            targets.dedup();
            targets
        })
        .collect();

    let mut seen_cycles: BTreeSet<Vec<String>> = BTreeSet::new();
    let mut state = vec![0u8; scripts.len()];
    let mut path = Vec::new();

    for start in 0..scripts.len() {
        if state[start] == 0 {
            find_cycles(start, &edges, &mut state, &mut path, scripts, &mut seen_cycles);
        }
    }

    for cycle in seen_cycles {
        let chain = cycle.join(" -> ");
        let mut affected: Vec<String> = cycle.iter().map(|id| format!("{}.sql", id)).collect();
        affected.sort();
        out.push(Conflict {
            conflict_type: ConflictType::CircularDependency,
            severity: Severity::Error,
            description: format!("Dependency cycle: {} -> {}", chain, cycle[0]),
            affected_objects: affected,
            resolution: Resolution {
                strategy: ResolutionStrategy::Manual,
                description: "Break the dependency cycle".to_string(),
                steps: vec![
                    format!("Remove one @depends annotation along {} -> {}", chain, cycle[0]),
                    "Re-run the conflict scan".to_string(),
                ],
            },
        });
    }
}

/// Depth-first search; state 0 = unvisited, 1 = on stack, 2 = done.
fn find_cycles(
    node: usize,
    edges: &[Vec<usize>],
    state: &mut [u8],
    path: &mut Vec<usize>,
    scripts: &[MigrationScript],
    cycles: &mut BTreeSet<Vec<String>>,
) {
    state[node] = 1;
    path.push(node);

    for &next in &edges[node] {
        match state[next] {
            0 => find_cycles(next, edges, state, path, scripts, cycles),
            1 => {
                if let Some(pos) = path.iter().position(|&n| n == next) {
                    let mut cycle: Vec<String> =
                        path[pos..].iter().map(|&i| scripts[i].id.clone()).collect();
                    // Rotate so the smallest id leads; one entry per cycle.
                    if let Some(min_at) = cycle
                        .iter()
                        .enumerate()
                        .min_by(|a, b| a.1.cmp(b.1))
                        .map(|(i, _)| i)
                    {
                        cycle.rotate_left(min_at);
                    }
                    cycles.insert(cycle);
                }
            }
            _ => {}
        }
    }

    path.pop();
    state[node] = 2;
}

fn checksum_mismatches(
    scripts: &[MigrationScript],
    applied: &[MigrationRecord],
    stored: &[ChecksumRecord],
    out: &mut Vec<Conflict>,
) {
    let stored: HashMap<&str, &str> = stored
        .iter()
        .map(|r| (r.migration_id.as_str(), r.checksum.as_str()))
        .collect();

    for record in applied {
        let Some(script) = scripts.iter().find(|s| s.id == record.id) else {
            continue;
        };
        let expected = stored
            .get(record.id.as_str())
            .copied()
            .unwrap_or(record.checksum.as_str());
        if expected == script.checksum {
            continue;
        }
        out.push(Conflict {
            conflict_type: ConflictType::ChecksumMismatch,
            severity: Severity::Critical,
            description: format!(
                "{} was modified after it was applied (stored {}, current {})",
                script.id, expected, script.checksum
            ),
            affected_objects: vec![file_name(script)],
            resolution: Resolution {
                strategy: ResolutionStrategy::Manual,
                description: format!("Reconcile {} with what was applied", script.id),
                steps: vec![
                    format!("Restore the applied content of {} from version control", file_name(script)),
                    format!(
                        "Or, if the edit is intentional and harmless, repair the stored checksum of {}",
                        script.id
                    ),
                    "Put further schema changes in a new migration".to_string(),
                ],
            },
        });
    }
}

fn invalid_file_names(entries: &[MigrationEntry], out: &mut Vec<Conflict>) {
    for entry in entries.iter().filter(|e| e.parsed.is_none()) {
        out.push(Conflict {
            conflict_type: ConflictType::InvalidFileName,
            severity: Severity::Warning,
            description: format!(
                "{} does not follow {{14-digit timestamp}}_{{name}}.sql and will be ignored",
                entry.file_name
            ),
            affected_objects: vec![entry.file_name.clone()],
            resolution: Resolution {
                strategy: ResolutionStrategy::Rename,
                description: format!("Rename {}", entry.file_name),
                steps: vec![
                    format!(
                        "Rename {} to YYYYMMDDHHMMSS_<name>.sql, or move it out of the migrations directory",
                        entry.file_name
                    ),
                ],
            },
        });
    }
}

fn missing_rollbacks(
    scripts: &[MigrationScript],
    applied: &HashSet<&str>,
    out: &mut Vec<Conflict>,
) {
    for script in scripts {
        if script.is_reversible() || applied.contains(script.id.as_str()) {
            continue;
        }
        out.push(Conflict {
            conflict_type: ConflictType::MissingRollback,
            severity: Severity::Warning,
            description: format!("{} has no rollback script", script.id),
            affected_objects: vec![file_name(script)],
            resolution: Resolution {
                strategy: ResolutionStrategy::Manual,
                description: format!("Add {}.down.sql", script.id),
                steps: vec![format!(
                    "Write {}.down.sql that reverses {}",
                    script.id,
                    file_name(script)
                )],
            },
        });
    }
}
