use anyhow::Result;
use console::style;
use std::path::Path;

use crate::core::terminal::{
    print_error, print_info, print_link, print_status, print_success, print_warn,
};
use crate::platform::{NativePlatform, Platform};

pub const LOG_FILE_NAME: &str = "hookwork.log";
pub const PID_FILE_NAME: &str = "hookwork.pid";

fn running_pid(pid_file: &Path) -> Option<String> {
    let pid = std::fs::read_to_string(pid_file).ok()?;
    let pid = pid.trim().to_string();
    if !pid.is_empty() && NativePlatform::process_alive(&pid) {
        Some(pid)
    } else {
        None
    }
}

pub async fn gateway_start(
    run_dir: &Path,
    pid_file: &Path,
    api_host: Option<&str>,
    api_port: Option<u16>,
) -> Result<()> {
    std::fs::create_dir_all(run_dir)?;
    NativePlatform::restrict_dir_permissions(run_dir);
    if let Some(pid) = running_pid(pid_file) {
        print_warn(&format!(
            "Gateway is already running (PID {}). Use 'hookwork gateway stop' first.",
            pid
        ));
        return Ok(());
    }

    let log_path = run_dir.join(LOG_FILE_NAME);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    NativePlatform::restrict_file_permissions(&log_path);

    let exe = std::env::current_exe()?;
    let mut child_cmd = std::process::Command::new(exe);
    child_cmd.arg("daemon-run");
    if let Some(port) = api_port {
        child_cmd.arg("--api-port").arg(port.to_string());
    }
    if let Some(host) = api_host {
        child_cmd.arg("--api-host").arg(host);
    }

    let child = child_cmd
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    std::fs::write(pid_file, child.id().to_string())?;

    println!();
    print_success("Gateway started in the background.");
    print_status(
        "Gateway",
        &format!(
            "{} (PID {})",
            style("RUNNING").green().bold(),
            style(child.id()).dim()
        ),
    );
    print_link("Log file", &log_path.display().to_string());
    println!();
    Ok(())
}

pub async fn gateway_stop(pid_file: &Path) -> Result<()> {
    match running_pid(pid_file) {
        Some(pid) => {
            NativePlatform::kill_process(&pid)?;
            print_status(
                "Gateway",
                &format!(
                    "{} (was PID {})",
                    style("STOPPED").red().bold(),
                    style(&pid).dim()
                ),
            );
        }
        None => print_info("Gateway is not currently running."),
    }
    std::fs::remove_file(pid_file).ok();
    println!();
    Ok(())
}

pub async fn gateway_status(pid_file: &Path) -> Result<()> {
    match running_pid(pid_file) {
        Some(pid) => print_status(
            "Gateway",
            &format!(
                "{} (PID {})",
                style("RUNNING").green().bold(),
                style(pid).dim()
            ),
        ),
        None => {
            print_status("Gateway", &style("STOPPED").red().bold().to_string());
            print_info(&format!(
                "Run {} to start the daemon.",
                style("hookwork gateway start").cyan().bold()
            ));
        }
    }
    println!();
    Ok(())
}

pub async fn follow_logs(run_dir: &Path) -> Result<()> {
    let log_file = run_dir.join(LOG_FILE_NAME);
    if !log_file.exists() {
        print_error(&format!(
            "Log file not found at {}",
            style(log_file.display()).dim()
        ));
        return Ok(());
    }
    print_info(&format!(
        "Following {} - press {} to stop.",
        style(LOG_FILE_NAME).cyan(),
        style("Ctrl+C").bold().yellow()
    ));
    println!();
    let mut child = NativePlatform::tail_file(&log_file)?;
    let _ = child.wait()?;
    Ok(())
}
