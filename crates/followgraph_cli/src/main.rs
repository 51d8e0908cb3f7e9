//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `followgraph_core` wiring against a real SQLite database.
//! - Run the follow/unfollow round trip and print `key=value` lines.
//!
//! Configuration comes from `FOLLOWGRAPH_*` environment variables; see
//! `followgraph_core::config`.

use followgraph_core::db::{open_db_in_memory, open_db_with};
use followgraph_core::{init_logging, CoreConfig, GraphError, GraphService};
use log::info;
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("followgraph error={err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = CoreConfig::from_env()?;
    if let Some(log_dir) = config.log_dir.as_ref() {
        init_logging(&config.log_level, log_dir)?;
    }

    let mut conn = match config.db_path.as_ref() {
        Some(path) => open_db_with(path, &config.store)?,
        None => open_db_in_memory()?,
    };
    let mut service = GraphService::new(&mut conn);

    println!("followgraph_core version={}", followgraph_core::core_version());

    let alice = service.create_user("alice")?;
    let bob = service.create_user("bob")?;
    let mut stale_alice = service.load(alice)?;
    let mut held_alice = service.load(alice)?;

    service.follow(alice, bob, &mut [&mut held_alice])?;
    println!(
        "after_follow following_count={} follower_count={}",
        service.following_count(alice)?,
        service.follower_count(bob)?
    );
    println!(
        "held_copy following={:?}",
        service.read_following(&mut held_alice)?
    );
    match service.read_following(&mut stale_alice) {
        Err(GraphError::StaleReadViolation { .. }) => println!("other_copy stale_read=detected"),
        Ok(members) => println!("other_copy following={members:?}"),
        Err(err) => return Err(err.into()),
    }

    service.unfollow(alice, bob, &mut [])?;
    service.reload(&mut stale_alice)?;
    println!(
        "after_unfollow following_count={} reloaded_following={:?}",
        service.following_count(alice)?,
        service.read_following(&mut stale_alice)?
    );

    info!("event=cli_demo module=cli status=ok");
    Ok(())
}
