//! CLI parse tests.

use super::{Cli, CliCommand};
use clap::Parser;

fn parse(args: &[&str]) -> CliCommand {
    let cli = Cli::try_parse_from(args).unwrap();
    cli.command
}

#[test]
fn cli_parse_run() {
    match parse(&["mim", "run"]) {
        CliCommand::Run { drain } => assert!(!drain),
        _ => panic!("expected Run"),
    }
}

#[test]
fn cli_parse_run_drain() {
    match parse(&["mim", "run", "--drain"]) {
        CliCommand::Run { drain } => assert!(drain),
        _ => panic!("expected Run with --drain"),
    }
}

#[test]
fn cli_parse_add() {
    match parse(&["mim", "add", "https://cdn.example/a.zip"]) {
        CliCommand::Add { url, auth_token } => {
            assert_eq!(url, "https://cdn.example/a.zip");
            assert!(auth_token.is_none());
        }
        _ => panic!("expected Add"),
    }
}

#[test]
fn cli_parse_add_auth_token() {
    match parse(&[
        "mim",
        "add",
        "https://dav.example/share/",
        "--auth-token",
        "sekrit",
    ]) {
        CliCommand::Add { url, auth_token } => {
            assert_eq!(url, "https://dav.example/share/");
            assert_eq!(auth_token.as_deref(), Some("sekrit"));
        }
        _ => panic!("expected Add with --auth-token"),
    }
}

#[test]
fn cli_parse_status() {
    match parse(&["mim", "status"]) {
        CliCommand::Status => {}
        _ => panic!("expected Status"),
    }
}

#[test]
fn cli_parse_quarantine() {
    match parse(&["mim", "quarantine"]) {
        CliCommand::Quarantine => {}
        _ => panic!("expected Quarantine"),
    }
}

#[test]
fn cli_rejects_unknown_subcommand() {
    assert!(Cli::try_parse_from(["mim", "explode"]).is_err());
}

#[test]
fn cli_add_requires_url() {
    assert!(Cli::try_parse_from(["mim", "add"]).is_err());
}
