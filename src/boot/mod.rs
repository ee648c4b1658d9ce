//! Ordered engine startup.
//!
//! Boot is a fixed list of [`Stage`]s run one after another over a shared
//! [`EngineState`]. Each stage either completes, is skipped because its
//! precondition does not hold, or fails. Failures are classified by
//! [`Error::is_fatal`]: recoverable ones degrade the stage and boot carries
//! on, fatal ones stop the sequence and are returned as a [`BootFailure`].

pub mod secret;
pub mod stages;
pub mod state;
pub mod version_gate;

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, ErrorDomain};

pub use self::secret::{AuthSecret, SecretOrigin, provision_secret};
pub use self::stages::standard_stages;
pub use self::state::{BuildInfo, EngineState, ReleaseKind, Services, TimeSync};
pub use self::version_gate::{VersionDecision, check_version};

/// One step of the boot sequence.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable name used in logs and the boot report.
    fn name(&self) -> &'static str;

    /// Whether the stage should run given what earlier stages produced.
    fn applies(&self, _state: &EngineState) -> bool {
        true
    }

    /// Upper bound on the stage's run time. `None` defers to the sequencer default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, state: &mut EngineState) -> crate::error::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Skipped,
    Degraded { domain: ErrorDomain, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: &'static str,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub elapsed_ms: u64,
}

/// What happened to every stage, in execution order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootReport {
    pub stages: Vec<StageRecord>,
}

impl BootReport {
    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|r| r.stage).collect()
    }

    pub fn degraded(&self) -> impl Iterator<Item = &StageRecord> {
        self.stages
            .iter()
            .filter(|r| matches!(r.outcome, StageOutcome::Degraded { .. }))
    }
}

/// A fatal stage failure. No later stage has run.
#[derive(Debug)]
pub struct BootFailure {
    pub stage: &'static str,
    pub error: Error,
}

impl fmt::Display for BootFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "boot failed in stage {}: {}", self.stage, self.error)
    }
}

impl std::error::Error for BootFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A completed boot: the final engine state plus the per-stage report.
pub struct BootOutcome {
    pub state: EngineState,
    pub report: BootReport,
}

pub struct Sequencer {
    stages: Vec<Box<dyn Stage>>,
    default_timeout: Option<Duration>,
}

impl Sequencer {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self {
            stages,
            default_timeout: None,
        }
    }

    /// The production stage list.
    pub fn standard() -> Self {
        Self::new(standard_stages())
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order. Stops at the first fatal error.
    pub async fn run(&self, mut state: EngineState) -> Result<BootOutcome, BootFailure> {
        let mut report = BootReport::default();
        let boot_started = Instant::now();

        for stage in &self.stages {
            let name = stage.name();
            if !stage.applies(&state) {
                tracing::info!(stage = name, "Stage skipped");
                report.stages.push(StageRecord {
                    stage: name,
                    outcome: StageOutcome::Skipped,
                    elapsed_ms: 0,
                });
                continue;
            }

            tracing::debug!(stage = name, "Stage starting");
            let started = Instant::now();
            let result = match stage.timeout().or(self.default_timeout) {
                Some(limit) => match tokio::time::timeout(limit, stage.run(&mut state)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::StageTimeout {
                        stage: name,
                        timeout: limit,
                    }),
                },
                None => stage.run(&mut state).await,
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(()) => {
                    tracing::info!(stage = name, elapsed_ms, "Stage completed");
                    StageOutcome::Completed
                }
                Err(error) if !error.is_fatal() => {
                    let domain = error.domain();
                    if domain == ErrorDomain::Connection {
                        tracing::error!(
                            stage = name,
                            domain = domain.as_str(),
                            "Machine unavailable, continuing without hardware: {}",
                            error
                        );
                    } else {
                        tracing::warn!(
                            stage = name,
                            domain = domain.as_str(),
                            "Stage degraded: {}",
                            error
                        );
                    }
                    StageOutcome::Degraded {
                        domain,
                        message: error.to_string(),
                    }
                }
                Err(error) => {
                    tracing::error!(
                        stage = name,
                        domain = error.domain().as_str(),
                        elapsed_ms,
                        "Stage failed, aborting boot: {}",
                        error
                    );
                    return Err(BootFailure { stage: name, error });
                }
            };
            report.stages.push(StageRecord {
                stage: name,
                outcome,
                elapsed_ms,
            });
        }

        tracing::info!(
            elapsed_ms = boot_started.elapsed().as_millis() as u64,
            degraded = report.degraded().count(),
            "Boot sequence finished"
        );
        Ok(BootOutcome { state, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::state::Services;
    use crate::config::BootConfig;
    use crate::error::{CollaboratorError, PersistenceError, ServerError};
    use crate::machine::{Machine, SimulatedMachine};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Recording {
        name: &'static str,
        log: Log,
        result: fn() -> crate::error::Result<()>,
    }

    #[async_trait]
    impl Stage for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _state: &mut EngineState) -> crate::error::Result<()> {
            self.log.lock().unwrap().push(self.name);
            (self.result)()
        }
    }

    fn ok() -> crate::error::Result<()> {
        Ok(())
    }

    fn recording(name: &'static str, log: &Log) -> Box<dyn Stage> {
        Box::new(Recording {
            name,
            log: log.clone(),
            result: ok,
        })
    }

    /// Attaches a machine handle, as the real connect stage does.
    struct Attach;

    #[async_trait]
    impl Stage for Attach {
        fn name(&self) -> &'static str {
            "attach"
        }

        async fn run(&self, state: &mut EngineState) -> crate::error::Result<()> {
            let machine = SimulatedMachine::attached();
            machine.connect().await?;
            state.machine = Some(Arc::new(machine));
            Ok(())
        }
    }

    /// Needs the machine handle an earlier stage attached.
    struct RequiresMachine;

    #[async_trait]
    impl Stage for RequiresMachine {
        fn name(&self) -> &'static str {
            "requires-machine"
        }

        async fn run(&self, state: &mut EngineState) -> crate::error::Result<()> {
            if state.machine.is_none() {
                return Err(ServerError::Assembly("machine handle missing".to_string()).into());
            }
            Ok(())
        }
    }

    struct Slow;

    #[async_trait]
    impl Stage for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(20))
        }

        async fn run(&self, _state: &mut EngineState) -> crate::error::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn test_state(dir: &std::path::Path) -> EngineState {
        let services = Services::standard(BootConfig::for_data_dir(dir));
        EngineState::new(BuildInfo::current(false), services)
    }

    #[tokio::test]
    async fn stages_run_in_declared_order() {
        let dir = tempdir().unwrap();
        let log = Log::default();
        let sequencer = Sequencer::new(vec![
            recording("first", &log),
            recording("second", &log),
            recording("third", &log),
        ]);

        let outcome = sequencer.run(test_state(dir.path())).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(outcome.report.names(), vec!["first", "second", "third"]);
        assert!(
            outcome
                .report
                .stages
                .iter()
                .all(|r| r.outcome == StageOutcome::Completed)
        );
    }

    #[tokio::test]
    async fn misordered_dependency_is_detected() {
        let dir = tempdir().unwrap();
        let sequencer = Sequencer::new(vec![Box::new(RequiresMachine), Box::new(Attach)]);

        let failure = sequencer.run(test_state(dir.path())).await.err().unwrap();
        assert_eq!(failure.stage, "requires-machine");

        let sequencer = Sequencer::new(vec![Box::new(Attach), Box::new(RequiresMachine)]);
        assert!(sequencer.run(test_state(dir.path())).await.is_ok());
    }

    #[tokio::test]
    async fn recoverable_error_degrades_and_continues() {
        let dir = tempdir().unwrap();
        let log = Log::default();
        let sequencer = Sequencer::new(vec![
            recording("before", &log),
            Box::new(Recording {
                name: "flaky",
                log: log.clone(),
                result: || Err(CollaboratorError::call_failed("driver", "get", "timeout").into()),
            }),
            recording("after", &log),
        ]);

        let outcome = sequencer.run(test_state(dir.path())).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["before", "flaky", "after"]);
        assert!(matches!(
            outcome.report.outcome("flaky"),
            Some(StageOutcome::Degraded {
                domain: ErrorDomain::Collaborator,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn fatal_error_stops_later_stages() {
        let dir = tempdir().unwrap();
        let log = Log::default();
        let sequencer = Sequencer::new(vec![
            recording("before", &log),
            Box::new(Recording {
                name: "broken",
                log: log.clone(),
                result: || {
                    Err(PersistenceError::CreateDir {
                        path: "/readonly".into(),
                        source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                    }
                    .into())
                },
            }),
            recording("never", &log),
        ]);

        let failure = sequencer.run(test_state(dir.path())).await.err().unwrap();

        assert_eq!(failure.stage, "broken");
        assert_eq!(failure.error.domain(), ErrorDomain::Persistence);
        assert_eq!(*log.lock().unwrap(), vec!["before", "broken"]);
    }

    #[tokio::test]
    async fn stage_timeout_is_fatal() {
        let dir = tempdir().unwrap();
        let log = Log::default();
        let sequencer = Sequencer::new(vec![Box::new(Slow), recording("never", &log)]);

        let failure = sequencer.run(test_state(dir.path())).await.err().unwrap();

        assert_eq!(failure.stage, "slow");
        assert!(matches!(failure.error, Error::StageTimeout { stage: "slow", .. }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn standard_sequence_order() {
        assert_eq!(
            Sequencer::standard().stage_names(),
            vec![
                "create-data-directories",
                "apply-engine-config",
                "platform-defaults",
                "check-engine-version",
                "connect-machine",
                "set-units",
                "configure-driver",
                "fetch-firmware",
                "load-commands",
                "idle-machine",
                "provision-secret",
                "assemble-server",
                "start-listening",
            ]
        );
    }
}
