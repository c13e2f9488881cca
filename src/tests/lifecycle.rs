//! End-to-end lifecycle scenarios, driven through the session gateway the
//! way a transport driver would drive it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::Config;
use crate::hub::{Hub, SessionContext};
use crate::llm::testing::ScriptedTransport;
use crate::models::{AgentFsmState, TaskStatus};
use crate::protocol::{OutboundFrame, ReportDecision};
use crate::session::ChannelSession;

struct TestHub {
    hub: Arc<Hub>,
    _dir: TempDir,
}

async fn start_hub() -> TestHub {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_testing(dir.path());
    let hub = Hub::new(config, Arc::new(ScriptedTransport::new(vec![])))
        .await
        .unwrap();
    tokio::spawn(hub.clone().run());
    // Let the scheduler subscribe before the first events are published.
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestHub { hub, _dir: dir }
}

struct TestAgent {
    ctx: SessionContext,
    frames: UnboundedReceiver<OutboundFrame>,
}

impl TestAgent {
    /// Next frame, failing the test if none arrives in time.
    async fn expect_frame(&mut self) -> OutboundFrame {
        tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("session channel closed")
    }

    /// Waits for the next `push_task`, skipping unrelated frames.
    async fn expect_push(&mut self) -> (String, u64) {
        for _ in 0..10 {
            if let OutboundFrame::PushTask {
                task_id, generation, ..
            } = self.expect_frame().await
            {
                return (task_id, generation);
            }
        }
        panic!("no push_task frame arrived");
    }
}

async fn connect_agent(h: &TestHub, agent_id: &str, capabilities: &[&str]) -> TestAgent {
    let token = h.hub.tokens.generate(agent_id).await.unwrap();
    let (session, frames) = ChannelSession::new();
    let mut ctx = h.hub.open_session(session);

    h.hub
        .handle_frame(
            &mut ctx,
            json!({
                "type": "identify",
                "agent_id": agent_id,
                "token": token,
                "name": agent_id,
                "capabilities": capabilities,
            }),
        )
        .await
        .unwrap();

    let mut agent = TestAgent { ctx, frames };
    match agent.expect_frame().await {
        OutboundFrame::Identified { agent_id: id } => assert_eq!(id, agent_id),
        other => panic!("expected identified, got {other:?}"),
    }
    agent
}

async fn submit_task(h: &TestHub, description: &str, priority: &str, caps: &[&str]) -> String {
    h.hub
        .queue
        .submit(crate::models::TaskSubmission {
            description: description.to_string(),
            priority: priority.parse().unwrap(),
            submitted_by: "test".to_string(),
            needed_capabilities: caps.iter().map(|c| c.to_string()).collect(),
            metadata: Default::default(),
            depends_on: Default::default(),
            goal_id: None,
            complexity_tier: None,
            verification_steps: vec![],
            max_retries: None,
        })
        .await
        .unwrap()
        .id
}

async fn wait_for_status(h: &TestHub, task_id: &str, status: TaskStatus) {
    for _ in 0..500 {
        if h.hub.queue.get(task_id).await.map(|t| t.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "task {task_id} never reached {status}, currently {:?}",
        h.hub.queue.get(task_id).await.map(|t| t.status)
    );
}

async fn send(h: &TestHub, agent: &mut TestAgent, frame: serde_json::Value) {
    h.hub.handle_frame(&mut agent.ctx, frame).await.unwrap();
}

/// Scenario: submit, connect, push, accept, complete.
#[tokio::test]
async fn happy_path_task_lifecycle() {
    let h = start_hub().await;
    let task_id = submit_task(&h, "x", "normal", &["code"]).await;
    let mut agent = connect_agent(&h, "agent-a", &["code", "git"]).await;

    let (pushed_id, generation) = agent.expect_push().await;
    assert_eq!(pushed_id, task_id);
    assert_eq!(generation, 1);

    send(
        &h,
        &mut agent,
        json!({"type": "task_accepted", "task_id": task_id, "generation": generation}),
    )
    .await;
    wait_for_status(&h, &task_id, TaskStatus::Working).await;

    send(
        &h,
        &mut agent,
        json!({
            "type": "task_complete",
            "task_id": task_id,
            "generation": generation,
            "result": {"ok": true}
        }),
    )
    .await;
    wait_for_status(&h, &task_id, TaskStatus::Completed).await;

    // Agent is idle again.
    for _ in 0..100 {
        if h.hub.presence.get("agent-a").await.map(|s| s.fsm_state)
            == Some(AgentFsmState::Idle)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent never returned to idle");
}

/// Scenario: session drop before acceptance reclaims the task exactly once
/// and a later agent picks it up at the next generation.
#[tokio::test]
async fn disconnect_reclaims_and_reassigns() {
    let h = start_hub().await;
    let task_id = submit_task(&h, "urgent work", "urgent", &[]).await;

    let mut agent_b = connect_agent(&h, "agent-b", &[]).await;
    let (pushed_id, generation) = agent_b.expect_push().await;
    assert_eq!(pushed_id, task_id);
    assert_eq!(generation, 1);

    // Drop B before it accepts.
    h.hub.session_closed(&mut agent_b.ctx).await;
    wait_for_status(&h, &task_id, TaskStatus::Queued).await;
    let reclaimed = h.hub.queue.get(&task_id).await.unwrap();
    assert_eq!(reclaimed.generation, 2);

    // B is gone from presence.
    for _ in 0..100 {
        if h.hub.presence.get("agent-b").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.hub.presence.get("agent-b").await.is_none());

    // C takes over at generation 3 and completes.
    let mut agent_c = connect_agent(&h, "agent-c", &[]).await;
    let (pushed_id, generation) = agent_c.expect_push().await;
    assert_eq!(pushed_id, task_id);
    assert_eq!(generation, 3);

    send(
        &h,
        &mut agent_c,
        json!({"type": "task_accepted", "task_id": task_id, "generation": generation}),
    )
    .await;
    send(
        &h,
        &mut agent_c,
        json!({
            "type": "task_complete",
            "task_id": task_id,
            "generation": generation,
            "result": {}
        }),
    )
    .await;
    wait_for_status(&h, &task_id, TaskStatus::Completed).await;
}

/// Scenario: capability mismatch parks a task without blocking others.
#[tokio::test]
async fn capability_miss_skips_without_blocking() {
    let h = start_hub().await;
    let mut agent_d = connect_agent(&h, "agent-d", &["code", "git"]).await;

    let python_task = submit_task(&h, "needs python", "normal", &["python"]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.hub.queue.get(&python_task).await.unwrap().status,
        TaskStatus::Queued
    );
    assert_eq!(
        h.hub.presence.get("agent-d").await.unwrap().fsm_state,
        AgentFsmState::Idle
    );

    // A capability-free task goes to D while the python task stays queued.
    let any_task = submit_task(&h, "anyone", "normal", &[]).await;
    let (pushed_id, _) = agent_d.expect_push().await;
    assert_eq!(pushed_id, any_task);
    assert_eq!(
        h.hub.queue.get(&python_task).await.unwrap().status,
        TaskStatus::Queued
    );

    // E brings the missing capability.
    let mut agent_e = connect_agent(&h, "agent-e", &["python"]).await;
    let (pushed_id, _) = agent_e.expect_push().await;
    assert_eq!(pushed_id, python_task);
}

/// Scenario: a frozen agent neither acks nor disconnects; the sweep
/// reclaims and the scheduler reassigns.
#[tokio::test]
async fn stuck_sweep_reclaims_frozen_assignment() {
    let h = start_hub().await;
    let mut agent_f = connect_agent(&h, "agent-f", &["rare"]).await;

    let task_id = submit_task(&h, "will freeze", "normal", &["rare"]).await;
    let (pushed_id, generation) = agent_f.expect_push().await;
    assert_eq!(pushed_id, task_id);
    assert_eq!(generation, 1);

    // No ack, no disconnect. Test config: 1500ms stuck threshold, 100ms
    // sweep. The sweep reclaims and bumps the generation.
    wait_for_status(&h, &task_id, TaskStatus::Queued).await;
    assert_eq!(h.hub.queue.get(&task_id).await.unwrap().generation, 2);

    // A healthy agent picks it up.
    let mut agent_g = connect_agent(&h, "agent-g", &["rare"]).await;
    let (pushed_id, generation) = agent_g.expect_push().await;
    assert_eq!(pushed_id, task_id);
    assert_eq!(generation, 3);
}

/// Scenario: a stale completion from a long-gone assignee is discarded;
/// the current holder's completion is applied.
#[tokio::test]
async fn stale_ack_is_discarded() {
    let h = start_hub().await;
    let mut agent_g = connect_agent(&h, "agent-g2", &["special"]).await;

    let task_id = submit_task(&h, "contended", "normal", &["special"]).await;
    let (_, gen1) = agent_g.expect_push().await;
    assert_eq!(gen1, 1);

    // Hub reclaims (e.g. operator action); task is reassigned to H.
    h.hub.queue.reclaim(&task_id).await.unwrap();
    let mut agent_h = connect_agent(&h, "agent-h", &["special"]).await;
    let (pushed_id, gen3) = agent_h.expect_push().await;
    assert_eq!(pushed_id, task_id);
    assert_eq!(gen3, 3);

    send(
        &h,
        &mut agent_h,
        json!({"type": "task_accepted", "task_id": task_id, "generation": gen3}),
    )
    .await;
    wait_for_status(&h, &task_id, TaskStatus::Working).await;

    // G's delayed completion carries generation 1: discarded.
    send(
        &h,
        &mut agent_g,
        json!({
            "type": "task_complete",
            "task_id": task_id,
            "generation": gen1,
            "result": {"from": "g"}
        }),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let task = h.hub.queue.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Working);
    assert_eq!(task.assigned_to.as_deref(), Some("agent-h"));

    // H's completion at the current generation lands.
    send(
        &h,
        &mut agent_h,
        json!({
            "type": "task_complete",
            "task_id": task_id,
            "generation": gen3,
            "result": {"from": "h"}
        }),
    )
    .await;
    wait_for_status(&h, &task_id, TaskStatus::Completed).await;
    let task = h.hub.queue.get(&task_id).await.unwrap();
    assert_eq!(task.result.unwrap()["from"], "h");
}

/// Reconnect reconciliation: matching generation continues, stale aborts.
#[tokio::test]
async fn state_report_reconciliation() {
    let h = start_hub().await;
    let mut agent = connect_agent(&h, "agent-r", &["niche"]).await;

    let task_id = submit_task(&h, "survives reconnect", "normal", &["niche"]).await;
    let (_, generation) = agent.expect_push().await;
    send(
        &h,
        &mut agent,
        json!({"type": "task_accepted", "task_id": task_id, "generation": generation}),
    )
    .await;
    wait_for_status(&h, &task_id, TaskStatus::Working).await;

    // Matching report: continue.
    send(
        &h,
        &mut agent,
        json!({
            "type": "state_report",
            "active_task_id": task_id,
            "status": "working",
            "generation": generation
        }),
    )
    .await;
    match agent.expect_frame().await {
        OutboundFrame::StateReportAck { decision } => {
            assert_eq!(decision, ReportDecision::Continue)
        }
        other => panic!("expected ack, got {other:?}"),
    }
    match agent.expect_frame().await {
        OutboundFrame::TaskContinue { task_id: continued } => assert_eq!(continued, task_id),
        other => panic!("expected task_continue, got {other:?}"),
    }

    // Stale generation: abort.
    send(
        &h,
        &mut agent,
        json!({
            "type": "state_report",
            "active_task_id": task_id,
            "status": "working",
            "generation": generation - 1
        }),
    )
    .await;
    match agent.expect_frame().await {
        OutboundFrame::StateReportAck { decision } => {
            assert_eq!(decision, ReportDecision::Abort)
        }
        other => panic!("expected ack, got {other:?}"),
    }
}

/// Authentication: a bad token is rejected without revealing which part
/// failed, and unidentified sessions cannot act.
#[tokio::test]
async fn authentication_is_opaque_and_required() {
    let h = start_hub().await;
    h.hub.tokens.generate("agent-x").await.unwrap();

    let (session, mut frames) = ChannelSession::new();
    let mut ctx = h.hub.open_session(session);

    let result = h
        .hub
        .handle_frame(
            &mut ctx,
            json!({
                "type": "identify",
                "agent_id": "agent-x",
                "token": "wrong-token",
                "name": "agent-x",
            }),
        )
        .await;
    assert!(result.is_err());
    match frames.recv().await.unwrap() {
        OutboundFrame::Error { code, details } => {
            assert_eq!(code, "unauthorized");
            assert!(!details.contains("token"));
            assert!(!details.contains("agent_id"));
        }
        other => panic!("expected error frame, got {other:?}"),
    }

    // Frames before identify are refused.
    let result = h
        .hub
        .handle_frame(
            &mut ctx,
            json!({"type": "task_accepted", "task_id": "t", "generation": 1}),
        )
        .await;
    assert!(result.is_err());
}

/// Messaging: offline delivery lands in the mailbox and polls out in order.
#[tokio::test]
async fn offline_messages_queue_and_poll() {
    let h = start_hub().await;
    let mut online = connect_agent(&h, "online-agent", &[]).await;

    h.hub
        .router
        .send_direct("online-agent", "offline-agent", json!({"n": 1}), None)
        .await
        .unwrap();
    h.hub
        .router
        .send_direct("online-agent", "offline-agent", json!({"n": 2}), None)
        .await
        .unwrap();

    let (entries, max_seq) = h.hub.router.fetch("offline-agent", 0, 10).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(max_seq, 2);
    assert_eq!(entries[0].payload["n"], 1);

    // Connected recipients get frames instead.
    h.hub
        .router
        .send_direct("someone", "online-agent", json!({"live": true}), None)
        .await
        .unwrap();
    match online.expect_frame().await {
        OutboundFrame::Message { from, payload, .. } => {
            assert_eq!(from, "someone");
            assert_eq!(payload["live"], true);
        }
        other => panic!("expected message frame, got {other:?}"),
    }
}
