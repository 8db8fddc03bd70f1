//! The bidirectional message session.
//!
//! One WebSocket per client. The reader parses envelopes and serves
//! subscription control, acknowledgements, resume replay, and command
//! dispatch; a writer task owns the socket sink and merges direct replies
//! with fanned-out events. Per channel, events leave the session in strictly
//! increasing seq order.
//!
//! Liveness: the writer pings on an idle timer and closes the session when
//! nothing (message or pong) has been heard inside the liveness window. An
//! evicted or closed session is detached from every channel; the client
//! reconnects and resumes from its last acknowledged seq.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use pxb_events::EventFrame;
use pxb_files::FileInput;
use pxb_schemas::{
    BrokerError, CreateRequestInput, Envelope, Identity, MsgType, Result,
};

use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const LIVENESS_WINDOW: Duration = Duration::from_secs(90);
/// Upper bound on events replayed per `resume` message.
const RESUME_BATCH: i64 = 500;

pub(crate) async fn session_upgrade(
    ws: WebSocketUpgrade,
    State(st): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, st, identity))
}

async fn run_session(socket: WebSocket, st: Arc<AppState>, identity: Identity) {
    let session_id = Uuid::new_v4();
    let hub = st.broker.fabric.hub();

    let (event_tx, mut event_rx) = mpsc::channel::<EventFrame>(hub.queue_depth());
    let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(64);
    let last_seen = Arc::new(Mutex::new(Instant::now()));

    let (mut sink, mut stream) = socket.split();

    // ---- writer: merges replies, events, and keep-alives ----
    let writer_seen = Arc::clone(&last_seen);
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                frame = event_rx.recv() => match frame {
                    Some(frame) => {
                        let env = Envelope::event(&frame.channel, frame.seq, frame.payload);
                        let text = match serde_json::to_string(&env) {
                            Ok(t) => t,
                            Err(_) => continue,
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // all event senders gone: hub evicted this session
                    None => break,
                },
                _ = ticker.tick() => {
                    let idle = writer_seen.lock().expect("liveness lock").elapsed();
                    if idle > LIVENESS_WINDOW {
                        debug!(%session_id, "session liveness window elapsed; closing");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // ---- reader ----
    while let Some(incoming) = stream.next().await {
        let msg = match incoming {
            Ok(m) => m,
            Err(_) => break,
        };
        *last_seen.lock().expect("liveness lock") = Instant::now();

        match msg {
            Message::Text(text) => {
                let env: Envelope = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        send_env(
                            &reply_tx,
                            Envelope::error(None, "invalid-input", format!("bad envelope: {e}")),
                        )
                        .await;
                        continue;
                    }
                };
                handle_envelope(&st, &identity, session_id, &event_tx, &reply_tx, env).await;
            }
            Message::Ping(data) => {
                let _ = reply_tx.send(Message::Pong(data)).await;
            }
            Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Binary(_) => {
                send_env(
                    &reply_tx,
                    Envelope::error(None, "invalid-input", "binary frames not supported".into()),
                )
                .await;
            }
        }
    }

    hub.unsubscribe_all(session_id).await;
    drop(reply_tx);
    drop(event_tx);
    let _ = writer.await;
}

async fn send_env(reply_tx: &mpsc::Sender<Message>, env: Envelope) {
    if let Ok(text) = serde_json::to_string(&env) {
        let _ = reply_tx.send(Message::Text(text)).await;
    }
}

async fn handle_envelope(
    st: &Arc<AppState>,
    identity: &Identity,
    session_id: Uuid,
    event_tx: &mpsc::Sender<EventFrame>,
    reply_tx: &mpsc::Sender<Message>,
    env: Envelope,
) {
    match env.msg_type {
        MsgType::Subscribe => {
            let Some(channel) = env.channel else {
                send_env(
                    reply_tx,
                    Envelope::error(env.id, "invalid-input", "subscribe requires channel".into()),
                )
                .await;
                return;
            };
            st.broker
                .fabric
                .hub()
                .subscribe(&channel, session_id, event_tx.clone())
                .await;
            send_env(reply_tx, Envelope::ack("subscribed", Some(channel))).await;
        }
        MsgType::Unsubscribe => {
            let Some(channel) = env.channel else {
                send_env(
                    reply_tx,
                    Envelope::error(env.id, "invalid-input", "unsubscribe requires channel".into()),
                )
                .await;
                return;
            };
            st.broker
                .fabric
                .hub()
                .unsubscribe(&channel, session_id)
                .await;
            send_env(reply_tx, Envelope::ack("unsubscribed", Some(channel))).await;
        }
        MsgType::Resume => {
            let (Some(channel), Some(since)) = (env.channel.clone(), env.since) else {
                send_env(
                    reply_tx,
                    Envelope::error(
                        env.id,
                        "invalid-input",
                        "resume requires channel and since".into(),
                    ),
                )
                .await;
                return;
            };
            match st.broker.fabric.replay(&channel, since, RESUME_BATCH).await {
                Ok(records) => {
                    for record in records {
                        // same queue as live fan-out, so ordering holds
                        let _ = event_tx
                            .send(EventFrame {
                                channel: record.channel,
                                seq: record.seq,
                                payload: record.payload,
                            })
                            .await;
                    }
                }
                Err(e) => {
                    send_env(
                        reply_tx,
                        Envelope::error(env.id, e.code(), e.to_string()),
                    )
                    .await;
                }
            }
        }
        MsgType::Ack => {
            let (Some(channel), Some(seq)) = (env.channel, env.seq) else {
                send_env(
                    reply_tx,
                    Envelope::error(env.id, "invalid-input", "ack requires channel and seq".into()),
                )
                .await;
                return;
            };
            if let Err(e) = st
                .broker
                .fabric
                .ack(&channel, &identity.subject, seq)
                .await
            {
                warn!(channel, seq, error = %e, "ack persist failed");
            }
        }
        MsgType::Ping => {
            send_env(reply_tx, Envelope::ack("pong", None)).await;
        }
        MsgType::Cmd => {
            let op = env.op.clone().unwrap_or_default();
            let data = env.data.clone().unwrap_or(Value::Null);
            match dispatch_cmd(st, identity, &op, data).await {
                Ok(result) => send_env(reply_tx, Envelope::response(env.id, result)).await,
                Err(e) => {
                    send_env(reply_tx, Envelope::error(env.id, e.code(), e.to_string())).await
                }
            }
        }
        MsgType::Event | MsgType::Response | MsgType::Error => {
            send_env(
                reply_tx,
                Envelope::error(
                    env.id,
                    "invalid-input",
                    "server-initiated message type".into(),
                ),
            )
            .await;
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct IdArg {
    id: Uuid,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostResponseArgs {
    id: Uuid,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    files: Vec<FileInput>,
    #[serde(default)]
    answered_by: Option<Uuid>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFlowArgs {
    kind: String,
    owner_entity: Uuid,
    #[serde(default)]
    cursor: Value,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeFlowArgs {
    id: Uuid,
    event: String,
    #[serde(default)]
    data: Value,
}

fn parse<T: serde::de::DeserializeOwned>(data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| BrokerError::InvalidInput(format!("bad command data: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BrokerError::Internal(e.to_string()))
}

/// Each op mirrors the corresponding service contract.
async fn dispatch_cmd(
    st: &Arc<AppState>,
    identity: &Identity,
    op: &str,
    data: Value,
) -> Result<Value> {
    match op {
        "createRequest" => {
            let input: CreateRequestInput = parse(data)?;
            to_value(st.broker.requests.create(identity, input).await?)
        }
        "getRequest" => {
            let args: IdArg = parse(data)?;
            to_value(st.broker.requests.get(args.id).await?)
        }
        "claimRequest" => {
            let args: IdArg = parse(data)?;
            to_value(st.broker.requests.claim(args.id).await?)
        }
        "postResponse" => {
            let args: PostResponseArgs = parse(data)?;
            let responder = Identity {
                subject: identity.subject.clone(),
                entity_id: args.answered_by.or(identity.entity_id),
            };
            to_value(
                st.broker
                    .requests
                    .post_response(args.id, &responder, args.payload, args.files)
                    .await?,
            )
        }
        "cancelRequest" => {
            let args: IdArg = parse(data)?;
            to_value(st.broker.requests.cancel(args.id).await?)
        }
        "createFlow" => {
            let args: CreateFlowArgs = parse(data)?;
            to_value(
                st.broker
                    .flows
                    .create(&args.kind, args.owner_entity, args.cursor)
                    .await?,
            )
        }
        "resumeFlow" => {
            let args: ResumeFlowArgs = parse(data)?;
            to_value(st.broker.flows.resume(args.id, &args.event, args.data).await?)
        }
        "cancelFlow" => {
            let args: IdArg = parse(data)?;
            to_value(st.broker.flows.cancel(args.id).await?)
        }
        other => Err(BrokerError::InvalidInput(format!(
            "unknown command op: {other}"
        ))),
    }
}
