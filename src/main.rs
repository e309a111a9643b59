//! Demo application for the ZNode Inspector.
//!
//! Connects to a directory-backed hierarchy, prints the tree, watches the
//! root and reprints whenever a change notification arrives.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use znode_inspector::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("znode_inspector=debug".parse()?),
        )
        .init();

    let root_dir = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => std::env::current_dir()?,
    };
    println!("=== ZNode Inspector Demo ===\n");
    println!("Browsing: {}\n", root_dir.display());

    let (mut ui_loop, ui) = InteractiveLoop::new(TreeViewState::default());
    let mut builder = InspectorBuilder::new(Arc::new(FsConnector)).cache_capacity(100_000);
    if let Some(home) = std::env::var_os("ZNODE_INSPECTOR_HOME") {
        builder = builder.history_dir(home);
    }
    let inspector = builder.build(ui);

    let config = inspector
        .suggested_connection()
        .with(HOSTS_KEY, root_dir.to_string_lossy());
    inspector.connect(config);

    let ready = ui_loop
        .run_until(Duration::from_secs(10), |s| s.refreshes_applied > 0 || !s.notices.is_empty())
        .await;
    if !ready || !ui_loop.state().connected {
        for notice in &ui_loop.state().notices {
            eprintln!("{}: {}", notice.operation, notice.message);
        }
        anyhow::bail!("could not open {}", root_dir.display());
    }

    let state = ui_loop.state_mut();
    state.expand(NodePath::root());
    state.select([NodePath::root()]);
    for (path, outcome) in inspector.watch_selected(ui_loop.state()).await? {
        if let Err(e) = outcome {
            tracing::warn!("Not watching {}: {}", path, e);
        }
    }
    print_tree(ui_loop.state());

    println!("Press Ctrl+C to exit\n");
    println!("Try creating or removing directories under the root.\n");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut shown = ui_loop.state().refreshes_applied;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                println!("\nShutting down...");
                break;
            }
            more = ui_loop.run_next() => {
                if !more {
                    break;
                }
                let state = ui_loop.state_mut();
                for notice in state.notices.drain(..) {
                    eprintln!("[{}] {}", notice.operation, notice.message);
                }
                let toasts: Vec<_> = state.toasts.drain(..).collect();
                for toast in &toasts {
                    println!("\n{toast}\n");
                }
                if !toasts.is_empty() {
                    inspector.refresh_view(ui_loop.state());
                }
                if ui_loop.state().refreshes_applied != shown {
                    shown = ui_loop.state().refreshes_applied;
                    print_tree(ui_loop.state());
                }
            }
        }
    }

    inspector.disconnect(ui_loop.state_mut()).await?;
    inspector.registry().stop();
    println!("Done!");
    Ok(())
}

fn print_tree(state: &TreeViewState) {
    for line in state.render() {
        println!("{line}");
    }
    println!("---");
}
