use crate::split::{split_addresses, split_ports};
use crate::types::SubTask;

/// How a scan was cut into sub-tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitAxis {
    Addresses,
    Ports,
}

/// Cut a target/port space into sub-tasks.
///
/// Address splitting wins whenever it yields two or more pieces; each piece then keeps the
/// full port spec. Otherwise the single target is scanned with the port space split instead.
/// Never both at once.
pub fn plan(target: &str, ports: &str, parallelism: usize) -> Vec<SubTask> {
    plan_with_axis(target, ports, parallelism).1
}

pub fn plan_with_axis(target: &str, ports: &str, parallelism: usize) -> (SplitAxis, Vec<SubTask>) {
    let targets = split_addresses(target, parallelism);

    if let [single] = targets.as_slice() {
        let tasks = split_ports(ports, parallelism)
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| SubTask::new(i + 1, single.clone(), chunk))
            .collect();
        return (SplitAxis::Ports, tasks);
    }

    let tasks = targets
        .into_iter()
        .enumerate()
        .map(|(i, t)| SubTask::new(i + 1, t, ports))
        .collect();
    (SplitAxis::Addresses, tasks)
}
