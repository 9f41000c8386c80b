//! The message-bus wiring (spec §6): topology declaration plus one
//! `basic_qos(prefetch_count: 1)` / manual-ack consumer loop per queue.
//! `lapin` is the idiomatic async AMQP 0.9.1 client; nothing in the teacher
//! workspace drives a queue (it talks to Docker/K8s directly), so this
//! concern is enriched from outside it, per SPEC_FULL.md §1.5.

use std::sync::Arc;

use cd_build_worker::{BuildTriggered, BuildWorker};
use cd_deploy_orchestrator::{Cleanup, DeployOrchestrator, DeployTriggered, ProjectCleanup};
use cd_common::{Error, ErrorKind, Result};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::{builds, projects};

pub const BUILDS_EXCHANGE: &str = "builds";
pub const BUILD_TRIGGERED_KEY: &str = "build.triggered";
pub const BUILD_QUEUE: &str = "build-queue";

pub const DEPLOYS_EXCHANGE: &str = "deploys";
pub const DEPLOY_TRIGGERED_KEY: &str = "deploy.triggered";
pub const DEPLOYMENT_JOBS_QUEUE: &str = "deployment.jobs";
pub const PROJECT_CLEANUP_KEY: &str = "project.cleanup";
pub const PROJECT_CLEANUP_QUEUE: &str = "project.cleanup.jobs";

fn bus_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::source(ErrorKind::BusUnavailable, err)
}

pub async fn connect(bus_url: &str) -> Result<Connection> {
    Connection::connect(bus_url, ConnectionProperties::default())
        .await
        .map_err(bus_err)
}

/// Declares the exchanges/queues/bindings in spec §6. Idempotent: safe to
/// call on every startup.
pub async fn declare_topology(conn: &Connection) -> Result<()> {
    let channel = conn.create_channel().await.map_err(bus_err)?;

    channel
        .exchange_declare(
            BUILDS_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(bus_err)?;

    channel
        .exchange_declare(
            DEPLOYS_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(bus_err)?;

    for (queue, exchange, key) in [
        (BUILD_QUEUE, BUILDS_EXCHANGE, BUILD_TRIGGERED_KEY),
        (DEPLOYMENT_JOBS_QUEUE, DEPLOYS_EXCHANGE, DEPLOY_TRIGGERED_KEY),
        (PROJECT_CLEANUP_QUEUE, DEPLOYS_EXCHANGE, PROJECT_CLEANUP_KEY),
    ] {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(bus_err)?;
        channel
            .queue_bind(
                queue,
                exchange,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(bus_err)?;
    }

    Ok(())
}

async fn qos_one(conn: &Connection) -> Result<Channel> {
    let channel = conn.create_channel().await.map_err(bus_err)?;
    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .map_err(bus_err)?;
    Ok(channel)
}

/// AMQP redelivery count as reported by the broker's `x-death` header when
/// present (RabbitMQ dead-lettering), falling back to the method's own
/// `redelivered` flag (0 or 1) otherwise.
fn redelivery_count(delivery: &lapin::message::Delivery) -> u32 {
    delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get("x-death"))
        .and_then(|field| field.as_array())
        .map(|array| array.as_slice().len() as u32)
        .unwrap_or(delivery.redelivered as u32)
}

pub async fn publish_deploy_triggered(channel: &Channel, msg: &DeployTriggered) -> Result<()> {
    let body = serde_json::to_vec(msg).map_err(|e| Error::source(ErrorKind::Internal, e))?;
    channel
        .basic_publish(
            DEPLOYS_EXCHANGE,
            DEPLOY_TRIGGERED_KEY,
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await
        .map_err(bus_err)?
        .await
        .map_err(bus_err)?;
    Ok(())
}

/// Consumes `build-queue`. Never crashes the consumer task on a single
/// message's failure: logic errors are acked (no requeue, they can never
/// succeed), transient ones are nacked with requeue so the retry happens on
/// redelivery.
pub async fn run_build_consumer(
    conn: &Connection,
    pool: PgPool,
    worker: Arc<BuildWorker>,
) -> Result<()> {
    let channel = qos_one(conn).await?;
    let deploy_channel = conn.create_channel().await.map_err(bus_err)?;

    let mut consumer = channel
        .basic_consume(
            BUILD_QUEUE,
            "cd-server-build-worker",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(bus_err)?;

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "build consumer: delivery error");
                return Err(bus_err(e));
            }
        };

        let msg = match BuildTriggered::parse(&delivery.data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "build consumer: malformed message, acking without processing");
                let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                continue;
            }
        };

        match builds::handle_build_triggered(&pool, &worker, msg).await {
            Ok(Some(processed)) => {
                // Enqueue the deploy trigger (if any) *before* the build row
                // goes terminal -- if the enqueue fails and this delivery is
                // requeued, the build must still look non-terminal so the
                // retry re-enters this branch instead of `already_terminal`
                // silently dropping the deploy (spec §4.3 step 8's ordering).
                if let Some(deploy_msg) = &processed.deploy_trigger {
                    if let Err(e) = publish_deploy_triggered(&deploy_channel, deploy_msg).await {
                        error!(error = %e, "build consumer: failed to enqueue deploy.triggered, nacking");
                        let _ = delivery
                            .acker
                            .nack(BasicNackOptions {
                                requeue: true,
                                ..Default::default()
                            })
                            .await;
                        continue;
                    }
                }

                if let Err(e) = builds::persist_build_outcome(&pool, &processed.outcome).await {
                    warn!(build_id = %processed.outcome.build_id, error = %e, "build consumer: failed to persist build outcome");
                }
                let _ = delivery.acker.ack(BasicAckOptions::default()).await;
            }
            Ok(None) => {
                let _ = delivery.acker.ack(BasicAckOptions::default()).await;
            }
            Err(e) if e.kind().is_retriable() => {
                warn!(error = %e, "build consumer: transient failure, nacking with requeue");
                let _ = delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await;
            }
            Err(e) => {
                error!(error = %e, "build consumer: terminal failure, acking");
                let _ = delivery.acker.ack(BasicAckOptions::default()).await;
            }
        }
    }

    Ok(())
}

/// Consumes `deployment.jobs`.
pub async fn run_deploy_consumer(
    conn: &Connection,
    pool: PgPool,
    orchestrator: Arc<DeployOrchestrator>,
) -> Result<()> {
    let channel = qos_one(conn).await?;

    let mut consumer = channel
        .basic_consume(
            DEPLOYMENT_JOBS_QUEUE,
            "cd-server-deploy-orchestrator",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(bus_err)?;

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "deploy consumer: delivery error");
                return Err(bus_err(e));
            }
        };

        let msg = match DeployTriggered::parse(&delivery.data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "deploy consumer: malformed message, acking without processing");
                let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                continue;
            }
        };

        let header_redelivery_count = redelivery_count(&delivery);

        let tenant = match projects::get_project(&pool, msg.project_ref).await {
            Ok(project) => project.tenant_ref,
            Err(e) => {
                error!(error = %e, "deploy consumer: unknown project, acking");
                let _ = delivery.acker.ack(BasicAckOptions::default()).await;
                continue;
            }
        };

        let outcome = orchestrator
            .process(tenant, builds::default_limits(), msg, header_redelivery_count)
            .await;
        info!(deployment_id = %outcome.deployment_id, status = ?outcome.status, "deploy consumer: processed");
        let _ = delivery.acker.ack(BasicAckOptions::default()).await;
    }

    Ok(())
}

/// Consumes `project.cleanup.jobs`. Per spec §4.4.3, cleanup never
/// propagates an error -- every delivery is acked once `Cleanup::run`
/// returns.
pub async fn run_cleanup_consumer(conn: &Connection, cleanup: Arc<Cleanup>) -> Result<()> {
    let channel = qos_one(conn).await?;

    let mut consumer = channel
        .basic_consume(
            PROJECT_CLEANUP_QUEUE,
            "cd-server-cleanup",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(bus_err)?;

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "cleanup consumer: delivery error");
                return Err(bus_err(e));
            }
        };

        match ProjectCleanup::parse(&delivery.data) {
            Ok(msg) => cleanup.run(&msg).await,
            Err(e) => warn!(error = %e, "cleanup consumer: malformed message, acking anyway"),
        }
        let _ = delivery.acker.ack(BasicAckOptions::default()).await;
    }

    Ok(())
}
