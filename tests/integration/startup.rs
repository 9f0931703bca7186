use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use depstart::{
    cli::ErrorAction,
    config::Config,
    controller::ProcessController,
    error::DependentStartupError,
    events::{EventChannel, EventKind},
    graph::ServiceTable,
    rpc::{ConfigInfo, ProcessInfo, RpcError, SupervisorRpc},
    scheduler::{Phase, Scheduler},
    service::ProcessState,
};

/// Shared state behind the mock supervisor, so tests keep a handle after the
/// scheduler takes ownership of the RPC client.
#[derive(Default)]
struct MockState {
    /// Supervisor-side process states, as statename strings.
    states: BTreeMap<String, String>,
    /// Every start call issued, in order.
    starts: Vec<String>,
    /// Names whose start calls fail with a spawn fault.
    failing: Vec<String>,
    config_info: Vec<ConfigInfo>,
}

#[derive(Clone, Default)]
struct MockSupervisor {
    state: Rc<RefCell<MockState>>,
}

impl MockSupervisor {
    fn set_state(&self, name: &str, statename: &str) {
        self.state
            .borrow_mut()
            .states
            .insert(name.to_string(), statename.to_string());
    }

    fn fail_start(&self, name: &str) {
        self.state.borrow_mut().failing.push(name.to_string());
    }

    fn starts(&self) -> Vec<String> {
        self.state.borrow().starts.clone()
    }
}

impl SupervisorRpc for MockSupervisor {
    fn api_version(&self) -> Result<String, RpcError> {
        Ok("3.0".to_string())
    }

    fn start_process(&self, name: &str, _wait: bool) -> Result<bool, RpcError> {
        let mut state = self.state.borrow_mut();
        state.starts.push(name.to_string());
        // State lookups are keyed by the bare process name, matching
        // get_process_info below.
        let bare = name.split_once(':').map(|(_, p)| p).unwrap_or(name);
        if state.failing.iter().any(|f| f == bare) {
            return Err(RpcError::Fault {
                code: 50,
                message: format!("SPAWN_ERROR: {name}"),
            });
        }
        state.states.insert(bare.to_string(), "STARTING".to_string());
        Ok(true)
    }

    fn start_process_group(&self, name: &str, _wait: bool) -> Result<bool, RpcError> {
        self.state.borrow_mut().starts.push(format!("group:{name}"));
        Ok(true)
    }

    fn get_process_info(&self, name: &str) -> Result<ProcessInfo, RpcError> {
        let bare = name.split_once(':').map(|(_, p)| p).unwrap_or(name);
        let statename = self
            .state
            .borrow()
            .states
            .get(bare)
            .cloned()
            .unwrap_or_else(|| "STOPPED".to_string());
        Ok(ProcessInfo {
            name: bare.to_string(),
            group: bare.to_string(),
            statename,
        })
    }

    fn get_all_process_info(&self) -> Result<Vec<ProcessInfo>, RpcError> {
        Ok(self
            .state
            .borrow()
            .states
            .iter()
            .map(|(name, statename)| ProcessInfo {
                name: name.clone(),
                group: name.clone(),
                statename: statename.clone(),
            })
            .collect())
    }

    fn get_all_config_info(&self) -> Result<Vec<ConfigInfo>, RpcError> {
        Ok(self.state.borrow().config_info.clone())
    }
}

fn build_scheduler(yaml: &str) -> (Scheduler<MockSupervisor>, MockSupervisor) {
    let config: Config = serde_yaml::from_str(yaml).expect("valid test manifest");
    let table = ServiceTable::build(&config, ErrorAction::Skip).expect("valid graph");
    let supervisor = MockSupervisor::default();
    let controller = ProcessController::new(supervisor.clone());
    (Scheduler::new(table, controller), supervisor)
}

fn feed(scheduler: &mut Scheduler<MockSupervisor>, process: &str, state: ProcessState) {
    let name = format!("PROCESS_STATE_{state}");
    scheduler.handle_event(
        &name,
        &EventKind::ProcessState {
            process: process.to_string(),
            from_state: Some(ProcessState::Starting),
            state,
        },
    );
}

/// One protocol frame as the supervisor would send it.
fn frame(eventname: &str, processname: &str, from: &str) -> String {
    let payload = format!("processname:{processname} groupname:{processname} from_state:{from}");
    format!("eventname:{eventname} len:{}\n{payload}", payload.len())
}

#[test]
fn chain_starts_in_dependency_order() {
    let (mut scheduler, supervisor) = build_scheduler(
        r#"
services:
  consul:
    autostart: false
    dependent_startup: true
  slurmd:
    autostart: false
    dependent_startup: true
    priority: 10
    dependent_startup_wait_for: "consul"
  slurmd2:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "slurmd"
"#,
    );
    scheduler.run().unwrap();
    assert_eq!(scheduler.phase(), Phase::Listening);
    assert!(supervisor.starts().is_empty());

    feed(&mut scheduler, "consul", ProcessState::Starting);
    assert_eq!(supervisor.starts(), vec!["consul"]);

    feed(&mut scheduler, "consul", ProcessState::Running);
    assert_eq!(supervisor.starts(), vec!["consul", "slurmd"]);

    feed(&mut scheduler, "slurmd", ProcessState::Running);
    assert_eq!(supervisor.starts(), vec!["consul", "slurmd", "slurmd2"]);

    feed(&mut scheduler, "slurmd2", ProcessState::Running);
    assert_eq!(scheduler.phase(), Phase::Done);
}

#[test]
fn siblings_start_in_the_same_pass() {
    let (mut scheduler, supervisor) = build_scheduler(
        r#"
services:
  consul:
    autostart: false
    dependent_startup: true
  consul2:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "consul"
  slurmd:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "consul"
"#,
    );
    scheduler.run().unwrap();

    feed(&mut scheduler, "consul", ProcessState::Starting);
    feed(&mut scheduler, "consul", ProcessState::Running);

    let starts = supervisor.starts();
    assert!(starts.contains(&"consul2".to_string()));
    assert!(starts.contains(&"slurmd".to_string()));
}

#[test]
fn start_failure_keeps_scheduler_listening() {
    let (mut scheduler, supervisor) = build_scheduler(
        r#"
services:
  consul:
    autostart: false
    dependent_startup: true
  slurmd:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "consul"
"#,
    );
    supervisor.fail_start("slurmd");
    scheduler.run().unwrap();

    feed(&mut scheduler, "consul", ProcessState::Starting);
    feed(&mut scheduler, "consul", ProcessState::Running);
    assert!(supervisor.starts().contains(&"slurmd".to_string()));
    assert_eq!(scheduler.phase(), Phase::Listening);

    // The supervisor eventually reports the process; the run completes.
    feed(&mut scheduler, "slurmd", ProcessState::Running);
    assert_eq!(scheduler.phase(), Phase::Done);
}

#[test]
fn services_start_at_most_once() {
    let (mut scheduler, supervisor) = build_scheduler(
        r#"
services:
  consul:
    autostart: false
    dependent_startup: true
  slurmd:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "consul"
"#,
    );
    scheduler.run().unwrap();

    feed(&mut scheduler, "consul", ProcessState::Starting);
    feed(&mut scheduler, "unrelated", ProcessState::Running);
    feed(&mut scheduler, "unrelated", ProcessState::Exited);
    assert_eq!(supervisor.starts(), vec!["consul"]);

    feed(&mut scheduler, "consul", ProcessState::Running);
    feed(&mut scheduler, "unrelated", ProcessState::Running);
    assert_eq!(supervisor.starts(), vec!["consul", "slurmd"]);
}

#[test]
fn no_starts_after_done() {
    let (mut scheduler, supervisor) = build_scheduler(
        r#"
services:
  consul:
    autostart: false
    dependent_startup: true
"#,
    );
    scheduler.run().unwrap();

    feed(&mut scheduler, "other", ProcessState::Running);
    feed(&mut scheduler, "consul", ProcessState::Running);
    assert_eq!(scheduler.phase(), Phase::Done);

    let before = supervisor.starts().len();
    supervisor.set_state("consul", "EXITED");
    feed(&mut scheduler, "consul", ProcessState::Exited);
    feed(&mut scheduler, "consul", ProcessState::Stopped);
    assert_eq!(supervisor.starts().len(), before);
}

#[test]
fn listen_drives_full_protocol_round() {
    let (mut scheduler, supervisor) = build_scheduler(
        r#"
services:
  consul:
    autostart: false
    dependent_startup: true
"#,
    );
    scheduler.run().unwrap();

    let input = format!(
        "{}{}",
        frame("PROCESS_STATE_STARTING", "consul", "STOPPED"),
        frame("PROCESS_STATE_RUNNING", "consul", "STARTING"),
    );
    let mut output = Vec::new();
    let mut channel = EventChannel::new(input.as_bytes(), &mut output);

    scheduler.listen(&mut channel).unwrap();
    assert_eq!(scheduler.phase(), Phase::Done);
    assert_eq!(supervisor.starts(), vec!["consul"]);

    // Two full cycles: READY, then an acknowledgement per event.
    let written = String::from_utf8(output).unwrap();
    assert_eq!(written, "READY\nRESULT 2\nOKREADY\nRESULT 2\nOK");
}

#[test]
fn listen_returns_cleanly_on_closed_channel() {
    let (mut scheduler, _supervisor) = build_scheduler(
        r#"
services:
  consul:
    autostart: false
    dependent_startup: true
"#,
    );
    scheduler.run().unwrap();

    let mut output = Vec::new();
    let mut channel = EventChannel::new(&b""[..], &mut output);
    scheduler.listen(&mut channel).unwrap();
    assert_eq!(scheduler.phase(), Phase::Listening);
}

#[test]
fn cycle_is_rejected_with_membership() {
    let config: Config = serde_yaml::from_str(
        r#"
services:
  consul:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "consul3"
  consul2:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "consul"
  consul3:
    autostart: false
    dependent_startup: true
    dependent_startup_wait_for: "consul2"
"#,
    )
    .unwrap();

    let err = ServiceTable::build(&config, ErrorAction::Skip).unwrap_err();
    assert!(matches!(err, DependentStartupError::DependencyCycle { .. }));
    let message = err.to_string();
    assert!(message.contains("consul (unresolved: consul3)"));
    assert!(message.contains("consul2 (unresolved: consul)"));
    assert!(message.contains("consul3 (unresolved: consul2)"));
}

#[test]
fn group_map_from_supervisor_overrides_group() {
    let (scheduler, supervisor) = build_scheduler(
        r#"
services:
  consul:
    autostart: false
    dependent_startup: true
"#,
    );
    supervisor.state.borrow_mut().config_info.push(ConfigInfo {
        name: "consul".to_string(),
        group: "infra".to_string(),
    });

    let mut scheduler = scheduler;
    scheduler.run().unwrap();

    feed(&mut scheduler, "other", ProcessState::Running);
    assert_eq!(supervisor.starts(), vec!["infra:consul"]);

    // The targeted refresh after the start sees the STARTING process, so a
    // later event does not start it a second time.
    feed(&mut scheduler, "other", ProcessState::Exited);
    assert_eq!(supervisor.starts(), vec!["infra:consul"]);
}
