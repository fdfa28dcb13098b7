use serde_json::json;

use super::*;
use crate::test_helpers::Harness;

#[test]
fn parse_blank_line_is_none() {
    assert!(Command::parse("   ").unwrap().is_none());
}

#[test]
fn parse_login() {
    let cmd = Command::parse("login a@x.com secret").unwrap().unwrap();
    assert_eq!(cmd, Command::Login { email: "a@x.com".into(), password: "secret".into() });
}

#[test]
fn parse_register_and_upgrade() {
    let cmd = Command::parse("register Ana ana@x.com secret").unwrap().unwrap();
    assert!(matches!(cmd, Command::Register { ref name, .. } if name == "Ana"));
    let cmd = Command::parse("upgrade Ana ana@x.com secret").unwrap().unwrap();
    assert!(matches!(cmd, Command::Upgrade { ref email, .. } if email == "ana@x.com"));
}

#[test]
fn parse_rejects_wrong_arity() {
    let err = Command::parse("login a@x.com").unwrap_err();
    assert!(matches!(err, CommandError::Usage(_)));
    assert!(Command::parse("check").is_err());
}

#[test]
fn parse_stage_takes_json_object() {
    let cmd = Command::parse(r#"stage {"dailyCalories": 1800, "goal": "cut"}"#)
        .unwrap()
        .unwrap();
    assert_eq!(cmd, Command::Stage(json!({ "dailyCalories": 1800, "goal": "cut" })));
    assert!(matches!(Command::parse("stage [1,2]").unwrap_err(), CommandError::Usage(_)));
    assert!(matches!(Command::parse("stage {oops").unwrap_err(), CommandError::InvalidJson(_)));
}

#[test]
fn parse_unknown_verb() {
    let err = Command::parse("dance now").unwrap_err();
    assert_eq!(err.to_string(), "unknown command `dance`");
}

#[tokio::test]
async fn execute_login_and_status() {
    let h = Harness::new();
    h.identity.add_account("a@x.com", "secret", "u1");
    let (tx, _rx) = mpsc::channel(1);

    let reply = execute(&h.reconciler, &tx, Command::parse("login a@x.com secret").unwrap().unwrap())
        .await
        .unwrap();
    assert_eq!(reply, "signed in; go to Onboarding");

    let status = execute(&h.reconciler, &tx, Command::Status).await.unwrap();
    let value: Value = serde_json::from_str(&status).unwrap();
    assert_eq!(value["phase"], "authenticated");
    assert_eq!(value["current_user"]["uid"], "u1");
}

#[tokio::test]
async fn execute_surfaces_session_errors() {
    let h = Harness::new();
    let (tx, _rx) = mpsc::channel(1);

    let err = execute(&h.reconciler, &tx, Command::Login { email: "a@x.com".into(), password: "x".into() })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid email or password");
}

#[tokio::test]
async fn execute_online_queues_lifecycle_event() {
    let h = Harness::new();
    let (tx, mut rx) = mpsc::channel(1);

    execute(&h.reconciler, &tx, Command::Online).await.unwrap();
    assert_eq!(rx.recv().await, Some(LifecycleEvent::ConnectivityRestored));

    drop(rx);
    let err = execute(&h.reconciler, &tx, Command::Foreground).await.unwrap_err();
    assert!(matches!(err, CommandError::WatcherClosed));
}
