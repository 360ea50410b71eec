use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use connect_transport::udp::DEFAULT_EMULATOR_ADDR;

#[derive(Parser, Debug)]
#[command(name = "hw-connect")]
#[command(about = "Hardware wallet connection engine over the emulator transport")]
pub struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(flatten)]
    pub connection: ConnectionArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct ConnectionArgs {
    /// Settings file; defaults to ~/.hw-connect/settings.json.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long = "emulator", value_name = "ADDR", num_args = 1.., default_value = DEFAULT_EMULATOR_ADDR, global = true)]
    pub emulators: Vec<SocketAddr>,
    /// Message schema: `{"min_firmware": "4.0.0", "messages": {...}}`.
    #[arg(long, value_name = "FILE", action = ArgAction::Append, global = true)]
    pub schema: Vec<PathBuf>,
    /// Firmware release metadata used for compatibility checks.
    #[arg(long, value_name = "FILE", global = true)]
    pub remote_config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List devices reachable over the transport.
    Enumerate,
    /// Run a single method and print its response.
    Call(CallArgs),
    /// Answer JSON-lines requests on stdin.
    Serve,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    pub method: String,
    #[arg(long, value_name = "JSON", value_parser = parse_params)]
    pub params: Option<serde_json::Value>,
}

fn parse_params(raw: &str) -> Result<serde_json::Value, String> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))?;
    if !value.is_object() {
        return Err("params must be a JSON object".to_string());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_parses_method_and_params() {
        let cli = Cli::parse_from([
            "hw-connect",
            "--schema",
            "messages.json",
            "call",
            "getFeatures",
            "--params",
            r#"{"connectId":"emu-0"}"#,
        ]);
        let Command::Call(args) = cli.command else {
            panic!("expected call command");
        };
        assert_eq!(args.method, "getFeatures");
        assert_eq!(args.params.unwrap()["connectId"], "emu-0");
        assert_eq!(
            cli.connection.emulators,
            vec![DEFAULT_EMULATOR_ADDR.parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "hw-connect",
            "serve",
            "-vv",
            "--schema",
            "a.json",
            "--schema",
            "b.json",
            "--emulator",
            "127.0.0.1:21324",
            "127.0.0.1:21325",
            "--config",
            "settings.json",
        ]);
        assert!(matches!(cli.command, Command::Serve));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.connection.schema.len(), 2);
        assert_eq!(cli.connection.emulators.len(), 2);
        assert_eq!(
            cli.connection.config.as_deref(),
            Some(std::path::Path::new("settings.json"))
        );
    }

    #[test]
    fn rejects_non_object_params() {
        let result = Cli::try_parse_from([
            "hw-connect",
            "--schema",
            "m.json",
            "call",
            "typedCall",
            "--params",
            "[1,2]",
        ]);
        assert!(result.is_err());
    }
}
