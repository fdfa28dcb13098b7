use std::sync::Arc;

use fitsession::commands::{self, Command};
use fitsession::config::AppConfig;
use fitsession::identity::{IdentityProvider, RestIdentityProvider};
use fitsession::profile::FirestoreProfileStore;
use fitsession::session::{Collaborators, SessionReconciler};
use fitsession::store::EncryptedFileStore;
use fitsession::watchers;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const LIFECYCLE_QUEUE_CAPACITY: usize = 16;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env().expect("invalid configuration");

    let store = Arc::new(EncryptedFileStore::from_config(&config.store));
    let identity: Arc<dyn IdentityProvider> =
        Arc::new(RestIdentityProvider::new(config.identity).expect("identity client init failed"));
    let profiles =
        Arc::new(FirestoreProfileStore::new(config.profile, identity.clone()).expect("profile client init failed"));

    let reconciler = SessionReconciler::new(
        Collaborators { identity, profiles, credentials: store.clone(), staging: store },
        config.reconciler,
    );

    let _logger = watchers::spawn_state_logger(reconciler.subscribe_state());
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(LIFECYCLE_QUEUE_CAPACITY);
    let _watcher = watchers::spawn_lifecycle_watcher(reconciler.clone(), lifecycle_rx);

    let restored = reconciler.restore_session().await;
    tracing::info!(restored, "startup restore finished");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Ok(Some(line)) = lines.next_line().await {
        let reply = match Command::parse(&line) {
            Ok(None) => continue,
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => commands::execute(&reconciler, &lifecycle_tx, command)
                .await
                .unwrap_or_else(|e| format!("error: {e}")),
            Err(e) => format!("error: {e}"),
        };
        if stdout.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }

    tracing::info!("fitsession exiting");
}
