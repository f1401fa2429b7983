use flowci_core::cmd::{Cmd, CmdStatus};
use flowci_core::types::NodeStatus;

/// Node status implied by a command's status (and exit value once logged).
pub fn node_status_for(cmd: &Cmd) -> NodeStatus {
    match cmd.status {
        CmdStatus::Sent | CmdStatus::Pending => NodeStatus::Pending,
        CmdStatus::Running | CmdStatus::Executed => NodeStatus::Running,
        CmdStatus::Logged => {
            let exit = cmd.cmd_result.as_ref().and_then(|r| r.exit_value);
            if exit == Some(0) {
                NodeStatus::Success
            } else {
                NodeStatus::Failure
            }
        }
        CmdStatus::Killed | CmdStatus::Exception | CmdStatus::Rejected | CmdStatus::Stopped => {
            NodeStatus::Failure
        }
        CmdStatus::TimeoutKill => NodeStatus::Timeout,
    }
}
