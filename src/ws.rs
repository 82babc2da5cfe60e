use std::sync::Arc;

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::HyperTransport;
use crate::error::EngineError;
use crate::executor::{Orchestrator, RunReport};
use crate::models::dsl_model::RunPlan;

/// Frames sent back to the controller.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage<'a> {
    Accepted { name: &'a str },
    Report { report: &'a RunReport },
    Cancelled,
    Error { message: String },
}

/// Starts a run on the shared multi-thread runtime rather than on the
/// calling arbiter, so virtual users spread over all of its workers.
pub fn spawn_run(
    runs: &Handle,
    orchestrator: Orchestrator,
    plan: RunPlan,
) -> JoinHandle<Result<RunReport, EngineError>> {
    runs.spawn(async move { orchestrator.run(&plan).await })
}

/// One controller connection. Accepts a JSON plan per text frame and runs at
/// most one plan at a time; the text frame `cancel` aborts the current run.
pub struct WsSession {
    runs: Handle,
    running: Option<CancellationToken>,
}

impl WsSession {
    pub fn new(runs: Handle) -> Self {
        Self { runs, running: None }
    }

    fn reply(ctx: &mut ws::WebsocketContext<Self>, message: &WorkerMessage<'_>) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => tracing::error!("could not encode worker message: {}", err),
        }
    }

    fn start_run(&mut self, raw: &str, ctx: &mut ws::WebsocketContext<Self>) {
        if self.running.is_some() {
            Self::reply(
                ctx,
                &WorkerMessage::Error {
                    message: "a run is already in progress".to_string(),
                },
            );
            return;
        }

        let plan = match RunPlan::from_json(raw) {
            Ok(plan) => plan,
            Err(err) => {
                Self::reply(ctx, &WorkerMessage::Error { message: err.to_string() });
                return;
            }
        };

        let orchestrator = Orchestrator::new(Arc::new(HyperTransport::new(plan.timeout)));
        self.running = Some(orchestrator.cancel_token());
        Self::reply(ctx, &WorkerMessage::Accepted { name: &plan.name });
        tracing::info!(plan = %plan.name, "run requested over websocket");

        let run = spawn_run(&self.runs, orchestrator, plan);
        ctx.spawn(run.into_actor(self).map(|joined, act, ctx| {
            act.running = None;
            match joined {
                Ok(Ok(report)) => Self::reply(ctx, &WorkerMessage::Report { report: &report }),
                Ok(Err(err)) => Self::reply(ctx, &WorkerMessage::Error { message: err.to_string() }),
                Err(err) => Self::reply(
                    ctx,
                    &WorkerMessage::Error {
                        message: format!("run task failed: {}", err),
                    },
                ),
            }
        }));
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("controller connected");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(token) = self.running.take() {
            tracing::warn!("controller disconnected, aborting run");
            token.cancel();
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                if text.trim() == "cancel" {
                    if let Some(token) = &self.running {
                        token.cancel();
                        Self::reply(ctx, &WorkerMessage::Cancelled);
                    }
                } else {
                    self.start_run(&text, ctx);
                }
            }
            Ok(ws::Message::Ping(payload)) => ctx.pong(&payload),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(err) => {
                tracing::warn!("websocket protocol error: {}", err);
                ctx.stop();
            }
            _ => {}
        }
    }
}

pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    runs: web::Data<Handle>,
) -> Result<HttpResponse, Error> {
    ws::start(WsSession::new(runs.get_ref().clone()), &req, stream)
}
