use std::sync::Arc;

use anyhow::Context;
use resilient_rabbit::config::Settings;
use resilient_rabbit::logging;
use resilient_rabbit::rabbitmq::consumer::string_header;
use resilient_rabbit::rabbitmq::{
    handler_fn, ConnectionSupervisor, Consumer, EventLoop, LapinConnector, Outcome, RabbitMQError,
    TokioEventLoop,
};
use tokio::task::JoinError;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    logging::init(&settings.log_level);

    let event_loop: Arc<dyn EventLoop> = Arc::new(TokioEventLoop::current());
    let connector = Arc::new(LapinConnector::new(event_loop.clone()));
    let supervisor = Arc::new(
        ConnectionSupervisor::new(
            connector,
            settings.endpoint_selector()?,
            settings.backoff_policy(),
            event_loop.clone(),
        )
        .with_config(settings.supervisor_config()),
    );

    let id_header = settings.consumer.id_header.clone();
    let handler = handler_fn(move |body, headers| {
        if body.is_empty() {
            return Ok(Outcome::Quarantine);
        }
        let message_id = id_header
            .as_deref()
            .and_then(|key| string_header(headers, key).ok());
        info!(
            bytes = body.len(),
            message_id = message_id.as_deref().unwrap_or("-"),
            "Received message: {}",
            String::from_utf8_lossy(body)
        );
        Ok(Outcome::Ack)
    });

    let consumer = Consumer::new(settings.consumer_config(), handler, event_loop);
    consumer.start(&supervisor).await?;

    let runner = supervisor.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutdown signal received");
            consumer.stop().await;
        }
        finished = &mut run => return report(finished),
    }

    report(run.await)
}

fn report(finished: Result<Result<(), RabbitMQError>, JoinError>) -> anyhow::Result<()> {
    match finished {
        Ok(Ok(())) => {
            info!("Shut down cleanly");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Connection supervisor gave up");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("Supervisor task failed: {}", e)),
    }
}
