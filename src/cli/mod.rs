mod daemon;
mod engine;

use anyhow::Result;
use console::style;

use crate::core::terminal::{self, print_error, print_secret};
use crate::platform;

fn print_help() {
    terminal::print_banner();

    println!("{}", style("Runtime").bold());
    println!("  {:<26} Run the runtime in the foreground", "daemon-run [--api-host H] [--api-port P]");
    println!("  {:<26} Start / stop / inspect the background daemon", "gateway start|stop|status");
    println!("  {:<26} Follow the daemon log file", "logs");
    println!();
    println!("{}", style("Setup").bold());
    println!("  {:<26} Print a fresh vault key for HOOKWORK_VAULT_KEY", "keygen");
    println!("  {:<26} Show this help", "help");

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("hookwork").green()
    );
}

/// `--api-host` / `--api-port` overrides. Unparseable ports are an error
/// rather than a silent fallback.
pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
) -> Result<(Option<String>, Option<u16>)> {
    let mut api_host = None;
    let mut api_port = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    let raw = &args[i + 1];
                    api_port = Some(
                        raw.parse()
                            .map_err(|_| anyhow::anyhow!("invalid --api-port '{}'", raw))?,
                    );
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    Ok((api_host, api_port))
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    let data_dir = platform::data_dir()?;
    let run_dir = data_dir.join("run");
    let pid_file = run_dir.join(daemon::PID_FILE_NAME);

    match cmd {
        "daemon-run" => {
            let (api_host, api_port) = parse_api_server_flags(&args, 2)?;
            engine::run_engine(&data_dir, api_host, api_port).await
        }
        "gateway" => match args.get(2).map(String::as_str).unwrap_or("") {
            "start" => {
                let (api_host, api_port) = parse_api_server_flags(&args, 3)?;
                daemon::gateway_start(&run_dir, &pid_file, api_host.as_deref(), api_port).await
            }
            "stop" => daemon::gateway_stop(&pid_file).await,
            "status" => daemon::gateway_status(&pid_file).await,
            _ => {
                print_error("Unknown or missing gateway command. Expected: start, stop, status");
                print_help();
                Ok(())
            }
        },
        "logs" => daemon::follow_logs(&run_dir).await,
        "keygen" => {
            print_secret("HOOKWORK_VAULT_KEY", &crate::core::vault::generate_key());
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command: {}", other));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_api_server_flags;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_api_server_flags_reads_host_and_port() {
        let argv = args(&[
            "hookwork",
            "daemon-run",
            "--api-host",
            "0.0.0.0",
            "--api-port",
            "19000",
        ]);
        let (host, port) = parse_api_server_flags(&argv, 2).unwrap();
        assert_eq!(host.as_deref(), Some("0.0.0.0"));
        assert_eq!(port, Some(19000));
    }

    #[test]
    fn absent_flags_leave_config_untouched() {
        let (host, port) = parse_api_server_flags(&args(&["hookwork", "daemon-run"]), 2).unwrap();
        assert!(host.is_none() && port.is_none());
    }

    #[test]
    fn bad_port_is_an_error() {
        let argv = args(&["hookwork", "gateway", "start", "--api-port", "http"]);
        assert!(parse_api_server_flags(&argv, 3).is_err());
    }
}
