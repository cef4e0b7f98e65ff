//! Signaling End-to-End Tests
//!
//! Drive the relay over a real WebSocket against the loopback engine.
//!
//! ## Test Scenarios
//!
//! 1. Offer → answer, session ACTIVE with source, recorder and sink
//! 2. Second offer without stop is rejected
//! 3. Stop without offer is a no-op
//! 4. Engine rejects the offer
//! 5. Transport closes while ACTIVE
//!
//! Plus stop idempotence, malformed input, trickle ICE, end of stream, RTP
//! sources and stop during a slow negotiation.

mod harness;

use harness::{init_test_tracing, with_id, HarnessResult, RelayTestHarness, BROWSER_OFFER};
use rtp_relay::config::{RtpSenderProfile, SourceConfig};
use rtp_relay::engine::{EngineCall, EngineEventKind, LoopbackEngine};
use rtp_relay::RelayConfig;
use serde_json::json;
use std::time::Duration;
use tracing::info;

const QUIET: Duration = Duration::from_millis(300);

fn release_calls(harness: &RelayTestHarness) -> usize {
    harness
        .engine
        .calls()
        .iter()
        .filter(|c| matches!(c, EngineCall::Release(_)))
        .count()
}

fn created_types(harness: &RelayTestHarness) -> Vec<&'static str> {
    harness
        .engine
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            EngineCall::CreateEndpoint { type_name, .. } => Some(type_name),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_offer_returns_answer() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    client.offer(BROWSER_OFFER).await?;
    let answer = client.expect("answer").await?;
    let sdp = answer["answer"].as_str().unwrap_or_default();
    assert!(sdp.starts_with("v=0"));
    assert!(sdp.contains("m=video"));

    assert_eq!(harness.session_count(), 1);
    assert_eq!(
        created_types(&harness),
        vec!["PlayerEndpoint", "RecorderEndpoint", "WebRtcEndpoint"]
    );

    let calls = harness.engine.calls();
    assert!(calls.iter().any(|c| matches!(c, EngineCall::Play(_))));
    assert!(calls.iter().any(|c| matches!(c, EngineCall::GatherCandidates(_))));

    // Gathered candidates are trickled to the client
    let trickled = client.drain(QUIET).await;
    assert!(!with_id(&trickled, "ice-candidate").is_empty());

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_second_offer_rejected() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    client.offer(BROWSER_OFFER).await?;
    client.expect("answer").await?;

    client.offer(BROWSER_OFFER).await?;
    let error = client.expect("error").await?;
    assert!(error["message"]
        .as_str()
        .unwrap_or_default()
        .starts_with("Invalid state"));

    assert_eq!(harness.session_count(), 1);
    assert_eq!(harness.engine.live_pipelines(), 1);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_without_offer_is_noop() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    client.stop().await?;
    assert!(client.drain(QUIET).await.is_empty());
    assert!(harness.engine.calls().is_empty());

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_offer_reports_error() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    harness.engine.set_reject_offers(true);
    let mut client = harness.create_client().await?;

    client.offer(BROWSER_OFFER).await?;
    let error = client.expect("error").await?;
    assert!(error["message"]
        .as_str()
        .unwrap_or_default()
        .starts_with("Negotiation failed"));

    assert_eq!(harness.session_count(), 0);
    assert_eq!(harness.engine.live_pipelines(), 0);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_close_while_active_releases_once() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    client.offer(BROWSER_OFFER).await?;
    client.expect("answer").await?;
    client.close().await;

    harness
        .wait_for("session removal", Duration::from_secs(5), |h| {
            h.session_count() == 0
        })
        .await?;
    harness
        .wait_for("pipeline release", Duration::from_secs(5), |h| {
            h.engine.live_pipelines() == 0
        })
        .await?;

    tokio::time::sleep(QUIET).await;
    assert_eq!(release_calls(&harness), 1);

    harness.shutdown().await;
    Ok(())
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_stop_twice_ends_playback_once() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    client.offer(BROWSER_OFFER).await?;
    client.expect("answer").await?;

    client.stop().await?;
    client.stop().await?;

    let messages = client.drain(QUIET).await;
    assert_eq!(with_id(&messages, "end-playback").len(), 1);
    assert!(with_id(&messages, "error").is_empty());
    assert_eq!(release_calls(&harness), 1);
    assert_eq!(harness.session_count(), 0);

    // The connection can start over
    client.offer(BROWSER_OFFER).await?;
    client.expect("answer").await?;
    assert_eq!(harness.session_count(), 1);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_end_of_stream_ends_playback() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    client.offer(BROWSER_OFFER).await?;
    client.expect("answer").await?;

    let player = harness
        .engine
        .endpoints_of_type("PlayerEndpoint")
        .remove(0);
    assert!(harness
        .engine
        .emit(&player, EngineEventKind::EndOfStream, json!({})));

    client.expect("end-playback").await?;
    harness
        .wait_for("session removal", Duration::from_secs(5), |h| {
            h.session_count() == 0
        })
        .await?;
    assert_eq!(harness.engine.live_pipelines(), 0);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_during_slow_negotiation() -> HarnessResult<()> {
    init_test_tracing();
    let engine = LoopbackEngine::new().with_offer_delay(Duration::from_millis(500));
    let harness = RelayTestHarness::with_config(RelayConfig::default(), engine).await?;
    let mut client = harness.create_client().await?;

    client.offer(BROWSER_OFFER).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.stop().await?;

    let messages = client.drain(Duration::from_secs(1)).await;
    info!("Received after stop: {:?}", messages);
    assert!(with_id(&messages, "answer").is_empty());
    assert_eq!(with_id(&messages, "end-playback").len(), 1);

    assert_eq!(harness.session_count(), 0);
    assert_eq!(harness.engine.live_pipelines(), 0);
    assert_eq!(release_calls(&harness), 1);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_server_shutdown_releases_sessions() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    client.offer(BROWSER_OFFER).await?;
    client.expect("answer").await?;

    let engine = harness.engine.clone();
    harness.shutdown().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.live_pipelines() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.live_pipelines(), 0);
    Ok(())
}

// =============================================================================
// Input handling
// =============================================================================

#[tokio::test]
async fn test_malformed_messages_reported() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    client.send_text("this is not json").await?;
    let error = client.expect("error").await?;
    assert!(error["message"]
        .as_str()
        .unwrap_or_default()
        .starts_with("Malformed message"));

    client.send(json!({"id": "subscribe"})).await?;
    let error = client.expect("error").await?;
    assert!(error["message"]
        .as_str()
        .unwrap_or_default()
        .contains("Invalid message, id: subscribe"));

    client.send(json!({"id": "offer"})).await?;
    let error = client.expect("error").await?;
    assert!(error["message"]
        .as_str()
        .unwrap_or_default()
        .starts_with("Configuration error"));

    // Still usable afterwards
    client.offer(BROWSER_OFFER).await?;
    client.expect("answer").await?;

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_remote_candidates_applied_and_late_ones_dropped() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    let candidate = json!({
        "id": "ice-candidate",
        "candidate": "candidate:1 1 UDP 2122260223 192.168.1.20 54400 typ host",
        "sdpMid": "0",
        "sdpMLineIndex": 0
    });

    // Before any offer: ignored
    client.send(candidate.clone()).await?;

    client.offer(BROWSER_OFFER).await?;
    client.expect("answer").await?;
    client.send(candidate.clone()).await?;

    client.stop().await?;
    client.expect("end-playback").await?;

    // After stop: dropped without error
    client.send(candidate).await?;
    let messages = client.drain(QUIET).await;
    assert!(with_id(&messages, "error").is_empty());

    let applied = harness
        .engine
        .calls()
        .iter()
        .filter(|c| matches!(c, EngineCall::AddIceCandidate { .. }))
        .count();
    assert_eq!(applied, 1);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_recording_controls() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayTestHarness::new().await?;
    let mut client = harness.create_client().await?;

    client.send(json!({"id": "start-recording"})).await?;
    client.expect("error").await?;

    client.offer(BROWSER_OFFER).await?;
    client.expect("answer").await?;
    client.send(json!({"id": "start-recording"})).await?;
    client.send(json!({"id": "stop-recording"})).await?;

    let messages = client.drain(QUIET).await;
    assert!(with_id(&messages, "error").is_empty());

    let calls = harness.engine.calls();
    assert!(calls.iter().any(|c| matches!(c, EngineCall::Record(_))));
    assert!(calls.iter().any(|c| matches!(c, EngineCall::StopRecording(_))));

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_capacity_limit() -> HarnessResult<()> {
    init_test_tracing();
    let config = RelayConfig {
        max_sessions: 1,
        ..Default::default()
    };
    let harness = RelayTestHarness::with_config(config, LoopbackEngine::new()).await?;

    let mut first = harness.create_client().await?;
    first.offer(BROWSER_OFFER).await?;
    first.expect("answer").await?;

    let mut second = harness.create_client().await?;
    second.offer(BROWSER_OFFER).await?;
    let error = second.expect("error").await?;
    assert!(error["message"]
        .as_str()
        .unwrap_or_default()
        .starts_with("Resource exhausted"));
    assert_eq!(harness.session_count(), 1);

    harness.shutdown().await;
    Ok(())
}

// =============================================================================
// RTP source
// =============================================================================

#[tokio::test]
async fn test_rtp_source_sends_connection_info() -> HarnessResult<()> {
    init_test_tracing();
    let config = RelayConfig {
        source: SourceConfig::Rtp(RtpSenderProfile::default()),
        ..Default::default()
    };
    let harness = RelayTestHarness::with_config(config, LoopbackEngine::new()).await?;
    let mut client = harness.create_client().await?;

    client.offer(BROWSER_OFFER).await?;
    let info = client.expect("connection-info").await?;
    let text = info["text"].as_str().unwrap_or_default();
    assert!(text.contains("video RTP"));
    client.expect("answer").await?;

    assert_eq!(created_types(&harness)[0], "RtpEndpoint");
    assert!(!harness
        .engine
        .calls()
        .iter()
        .any(|c| matches!(c, EngineCall::Play(_))));

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_secure_rtp_without_keys_rejected() -> HarnessResult<()> {
    init_test_tracing();
    let config = RelayConfig {
        source: SourceConfig::Rtp(RtpSenderProfile::default()),
        ..Default::default()
    };
    let harness = RelayTestHarness::with_config(config, LoopbackEngine::new()).await?;
    let mut client = harness.create_client().await?;

    client
        .send(json!({"id": "offer", "offer": BROWSER_OFFER, "useSecureTransport": true}))
        .await?;
    let error = client.expect("error").await?;
    assert!(error["message"]
        .as_str()
        .unwrap_or_default()
        .starts_with("Configuration error"));
    assert_eq!(harness.session_count(), 0);
    assert_eq!(harness.engine.live_pipelines(), 0);

    harness.shutdown().await;
    Ok(())
}
