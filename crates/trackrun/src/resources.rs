// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use sysinfo::{Pid, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Aggregate usage of a process tree
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Sum of per-process CPU usage, 100 per fully used core
    pub cpu_percent: f64,
    /// Resident memory in MB
    pub memory_mb: f64,
}

/// Source of resource samples for the worker.
pub trait ResourceProbe: Send {
    /// `None` when the target process is gone.
    fn sample(&mut self) -> Option<ResourceSample>;
}

/// Samples a process and all of its live descendants.
pub struct SysinfoProbe {
    system: System,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
        }
    }

    pub fn current() -> Self {
        Self::new(std::process::id())
    }

    /// The root pid followed by every process whose parent chain reaches it.
    fn process_tree(&self) -> Vec<Pid> {
        let processes = self.system.processes();
        if !processes.contains_key(&self.pid) {
            return Vec::new();
        }
        let mut tree = vec![self.pid];
        let mut seen: HashSet<Pid> = HashSet::from([self.pid]);
        let mut index = 0;
        while index < tree.len() {
            let parent = tree[index];
            for (pid, process) in processes {
                if process.parent() == Some(parent) && seen.insert(*pid) {
                    tree.push(*pid);
                }
            }
            index += 1;
        }
        tree
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> Option<ResourceSample> {
        self.system.refresh_processes();
        let tree = self.process_tree();
        if tree.is_empty() {
            return None;
        }

        let processes = self.system.processes();
        let (cpu, memory) = tree
            .iter()
            .filter_map(|pid| processes.get(pid))
            .fold((0.0_f64, 0_u64), |(cpu, memory), process| {
                (cpu + f64::from(process.cpu_usage()), memory + process.memory())
            });
        Some(ResourceSample {
            cpu_percent: cpu,
            memory_mb: memory as f64 / BYTES_PER_MB,
        })
    }
}
