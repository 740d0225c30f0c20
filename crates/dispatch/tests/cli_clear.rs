mod common;

use crate::common::test_env::TestEnv;
use anyhow::Result;
use predicates::prelude::*;

#[test]
fn clear_removes_all_sessions_for_an_agent() -> Result<()> {
  let env = TestEnv::new();
  env
    .dispatch()?
    .args(["run", "demo", "hello"])
    .assert()
    .success();
  assert_eq!(env.load_store().sessions.len(), 1);

  env
    .dispatch()?
    .args(["clear", "demo"])
    .assert()
    .success()
    .stdout(predicates::str::contains("Cleared 1 session(s) for demo").from_utf8());

  assert!(env.load_store().sessions.is_empty());
  Ok(())
}

#[test]
fn clear_without_matching_sessions_reports_nothing_to_do() -> Result<()> {
  let env = TestEnv::new();
  env
    .dispatch()?
    .args(["clear", "demo"])
    .assert()
    .success()
    .stdout(predicates::str::contains("No sessions tracked for agent").from_utf8());
  Ok(())
}

#[test]
fn clear_leaves_other_agents_untouched() -> Result<()> {
  let env = TestEnv::new();
  env.write_project_config(
    r#"
[agents.demo]
executor = "claude"

[agents.other]
executor = "claude"

[executors.claude]
binary = "fake-agent"
"#,
  )?;

  env
    .dispatch()?
    .args(["run", "demo", "hello"])
    .assert()
    .success();

  // The second run re-keys to the same stub session id, so give the other
  // agent its own store entry by rewriting the record's agent field.
  let store_path = env.store_path();
  let mut store = env.load_store();
  let (id, record) = {
    let (id, record) = store.sessions.iter().next().unwrap();
    (id.clone(), record.clone())
  };
  let mut other = record;
  other.agent = "other".to_string();
  let other_id = format!("{}-other", id);
  store.sessions.insert(other_id.clone(), other);
  store.save(&store_path)?;

  env
    .dispatch()?
    .args(["clear", "demo"])
    .assert()
    .success();

  let store = env.load_store();
  assert_eq!(store.sessions.len(), 1);
  assert!(store.sessions.contains_key(&other_id));
  Ok(())
}
