//! `gatekeeper transitions`: print the canonical transition table.

use anyhow::{Result, anyhow};

use gatekeeper::models::RunState;
use gatekeeper::policy;

pub fn cmd_transitions(from: Option<&str>) -> Result<()> {
    let states: Vec<RunState> = match from {
        Some(raw) => vec![raw.parse().map_err(|e: String| anyhow!(e))?],
        None => RunState::ALL.to_vec(),
    };

    for state in states {
        let targets = policy::allowed_targets(state);
        if targets.is_empty() {
            if from.is_some() || !state.is_terminal() {
                println!("{:<15} -> (none)", state);
            }
            continue;
        }
        let rendered: Vec<String> = targets
            .iter()
            .map(|target| match policy::next_state(state, *target) {
                Some(resolved) if resolved != *target => format!("{} (=> {})", target, resolved),
                _ => target.to_string(),
            })
            .collect();
        println!("{:<15} -> {}", state, rendered.join(", "));
    }

    Ok(())
}
