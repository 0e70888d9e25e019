//! `warden run` — one-shot execution command.
//!
//! Sends a single message to the agent, runs the job to completion on a
//! throwaway worker loop, and prints the result. Useful for scripting and
//! quick checks without standing up a long-running process.

use std::sync::Arc;

use warden_domain::config::Config;
use warden_domain::model::JobStatus;
use warden_engine::warden::Warden;

pub async fn run(config: Config, message: String, conversation: Option<String>, json_output: bool) -> anyhow::Result<()> {
    let warden = Arc::new(Warden::new(config)?);
    let job = warden.create_job(conversation, message, true, Some(String::new())).await?;

    // Drive exactly this one job; no background worker loop is needed for
    // a one-shot invocation.
    warden.run_job(job.id.clone()).await;

    let status = warden
        .poll_job(&job.id, 0)
        .ok_or_else(|| anyhow::anyhow!("job {} vanished after running", job.id))?;

    if json_output {
        let payload = serde_json::to_string_pretty(&status)?;
        println!("{payload}");
    } else {
        match status.status {
            JobStatus::Completed => println!("{}", status.result.unwrap_or_default()),
            JobStatus::WaitingForInput => {
                println!("waiting for input: {}", status.question.unwrap_or_default());
            }
            JobStatus::Failed => {
                eprintln!("error: {}", status.error.unwrap_or_default());
                std::process::exit(1);
            }
            JobStatus::Cancelled => {
                eprintln!("job cancelled");
                std::process::exit(1);
            }
            JobStatus::Pending | JobStatus::Running => {
                eprintln!("job did not reach a terminal state");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
