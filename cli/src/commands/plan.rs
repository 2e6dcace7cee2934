//! Plan command: print the start order as waves with each service's gates

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::domain::{DependencyCondition, ServiceRole, Topology};
use crate::ui;

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub name: String,
    pub waves: Vec<Vec<PlannedService>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedService {
    pub name: String,
    pub role: ServiceRole,
    pub replicas: u32,
    pub one_shot: bool,
    pub gates: Vec<PlannedGate>,
    /// Services held back until this one is up or done
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedGate {
    pub dependency: String,
    pub condition: DependencyCondition,
    /// `host:port` for reachable dependencies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

pub fn build_plan(topology: &Topology) -> Plan {
    let waves = topology
        .start_order()
        .into_iter()
        .map(|wave| {
            wave.into_iter()
                .map(|service| {
                    let gates = topology.gates_for(service);
                    PlannedService {
                        name: service.name.clone(),
                        role: service.role,
                        replicas: service.replicas,
                        one_shot: service.role.is_one_shot(),
                        gates: service
                            .depends_on
                            .iter()
                            .map(|dep| {
                                let gate = gates.iter().find(|g| g.dependency == dep.service);
                                PlannedGate {
                                    dependency: dep.service.clone(),
                                    condition: dep.condition,
                                    target: gate.map(|g| g.gate.target().to_string()),
                                    timeout_secs: gate.map(|g| g.gate.timeout().as_secs()),
                                }
                            })
                            .collect(),
                        dependents: topology
                            .dependents_of(&service.name)
                            .into_iter()
                            .map(|s| s.name.clone())
                            .collect(),
                    }
                })
                .collect()
        })
        .collect();

    Plan {
        name: topology.name().to_string(),
        waves,
    }
}

pub fn execute(topology: &Topology, json: bool) -> Result<()> {
    let plan = build_plan(topology);

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    ui::print_header(&format!("Start plan: {}", plan.name));
    for (i, wave) in plan.waves.iter().enumerate() {
        println!("{}", format!("Wave {}", i + 1).bright_white().bold());
        for service in wave {
            let kind = if service.one_shot { " (runs to completion)" } else { "" };
            println!(
                "  {} {} [{}]{}",
                "▸".bright_blue(),
                service.name.bold(),
                service.role,
                kind.dimmed()
            );
            for gate in &service.gates {
                match (&gate.target, gate.timeout_secs) {
                    (Some(target), Some(timeout)) => println!(
                        "      waits for {} at {} (timeout {}s)",
                        gate.dependency.cyan(),
                        target,
                        timeout
                    ),
                    _ => println!("      waits for {} to complete", gate.dependency.cyan()),
                }
            }
            if !service.dependents.is_empty() {
                println!("      {} {}", "holds back".dimmed(), service.dependents.join(", "));
            }
        }
    }
    println!();
    Ok(())
}
