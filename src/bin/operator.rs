use anyhow::{bail, Context as _};
use futures_util::StreamExt;
use kube::{
  api::Api,
  runtime::{
    controller::{self, Controller},
    watcher,
  },
  Client,
};
use log::{error, info};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use operator::{
  capa::{AWSMachineTemplate, AWSManagedControlPlane},
  controllers::{self, machine_template, managed_control_plane, Context},
  iam::aws::AssumeRoleSessions,
  Error, OperatorConfig,
};

async fn client() -> anyhow::Result<Client> {
  match Client::try_default().await {
    Ok(c) => Ok(c),
    _ => {
      use kube::config::KubeConfigOptions;
      use std::convert::TryFrom;

      match std::env::var("KUBE_CTX") {
        Ok(ctx) => Client::try_from(
          kube::Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(ctx),
            ..KubeConfigOptions::default()
          })
          .await?,
        )
        .context("Failed to load KUBE_CTX context"),

        _ => bail!("Failed to create client"),
      }
    }
  }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) -> anyhow::Result<()> {
  let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
  tokio::select! {
    res = tokio::signal::ctrl_c() => res.context("Failed to listen for SIGINT")?,
    _ = term.recv() => {},
    _ = shutdown.cancelled() => return Ok(()),
  }
  info!("shutdown requested, cancelling in-flight reconciles");
  shutdown.cancel();
  Ok(())
}

fn log_result<K: std::fmt::Debug>(res: Result<K, controller::Error<Error, watcher::Error>>) {
  match res {
    Ok(o) => {
      info!("Reconciled {:?}", o);
    }
    Err(controller::Error::ObjectNotFound(or)) => {
      info!("Object not found: {:?}", or);
    }
    Err(e) => {
      error!("Reconcile failed: {:?}", e);
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  env_logger::init();

  let config = OperatorConfig::from_env().context("Failed to load operator config")?;
  info!("starting with {:?}", config);
  let client = client().await?;
  let sessions = Arc::new(AssumeRoleSessions::from_env().await);
  let shutdown = CancellationToken::new();
  let ctx = Arc::new(Context::new(client.clone(), config, sessions, shutdown.clone()));

  let signals = tokio::spawn(watch_signals(shutdown.clone()));

  let templates = {
    let shutdown = shutdown.clone();
    Controller::new(
      Api::<AWSMachineTemplate>::all(client.clone()),
      watcher::Config::default(),
    )
    .graceful_shutdown_on(async move { shutdown.cancelled().await })
    .run(
      machine_template::reconcile,
      controllers::error_policy,
      ctx.clone(),
    )
    .for_each(|res| async move { log_result(res) })
  };

  let control_planes = {
    let shutdown = shutdown.clone();
    Controller::new(
      Api::<AWSManagedControlPlane>::all(client),
      watcher::Config::default(),
    )
    .graceful_shutdown_on(async move { shutdown.cancelled().await })
    .run(
      managed_control_plane::reconcile,
      controllers::error_policy,
      ctx,
    )
    .for_each(|res| async move { log_result(res) })
  };

  tokio::join!(templates, control_planes);
  shutdown.cancel();
  signals.await??;
  info!("controllers stopped");

  Ok(())
}
