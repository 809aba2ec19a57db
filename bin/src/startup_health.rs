use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use leasekeeper_core::tokio::{self, task::JoinHandle};

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

/// Every long running task must still be up once the window has passed.
pub async fn verify_startup_subsystems(tasks: &mut [(&str, &mut JoinHandle<()>)]) -> Result<()> {
    for (name, task) in tasks.iter_mut() {
        verify_background_task_running(name, task)
            .await
            .context("startup check failed")?;
    }
    Ok(())
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_running_task_passes() {
        let mut task = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(5)).await });
        verify_background_task_running("sleeper", &mut task)
            .await
            .unwrap();
        task.abort();
    }

    #[tokio::test]
    async fn test_exited_task_fails() {
        let mut task = tokio::spawn(async {});
        let err = verify_background_task_running("quitter", &mut task)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quitter exited"));
    }

    #[tokio::test]
    async fn test_subsystems_report_first_failure() {
        let mut up = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(5)).await });
        let mut down = tokio::spawn(async { panic!("boom") });
        let err = verify_startup_subsystems(&mut [("up", &mut up), ("down", &mut down)])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("down panicked"));
        up.abort();
    }
}
