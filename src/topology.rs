// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # Declarative Topology Installation
//!
//! Walks the broker configuration and asserts every declared exchange and
//! queue, installing the bindings implied by the `topics`, `direct` and
//! `fanout` shorthands. Runs after every successful connect, so a failover
//! re-creates the full topology; the per-entity assertion state keeps the
//! steady-state walk free of duplicate server calls.
//!
//! Ordering: an exchange is asserted before its queues, and each queue before
//! its binding. Distinct exchanges install in parallel, as does the binding
//! fan of a single exchange. Queue-only entries come last.

use crate::broker::BrokerCore;
use crate::errors::Result;
use crate::exchange::ExchangeSpec;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::debug;

pub(crate) async fn install(core: &Arc<BrokerCore>) -> Result<()> {
    debug!("installing topology");

    let exchange_tasks: Vec<_> = core
        .config
        .exchanges
        .iter()
        .map(|(key, spec)| {
            let name = spec.name.clone().unwrap_or_else(|| key.clone());
            let spec = spec.clone();
            let core = Arc::clone(core);
            async move { install_exchange(&core, &name, &spec).await }
        })
        .collect();
    for result in join_all(exchange_tasks).await {
        result?;
    }

    let queue_tasks: Vec<_> = core
        .config
        .queues
        .iter()
        .map(|(key, spec)| {
            let name = spec.name.clone().unwrap_or_else(|| key.clone());
            let core = Arc::clone(core);
            async move { core.queue(&name).await.assert().await }
        })
        .collect();
    for result in join_all(queue_tasks).await {
        result?;
    }

    debug!("topology installed");
    Ok(())
}

async fn install_exchange(core: &Arc<BrokerCore>, name: &str, spec: &ExchangeSpec) -> Result<()> {
    let exchange = core.exchange(name).await;
    exchange.assert().await?;

    let mut bindings: Vec<(String, String)> = Vec::new();
    if let Some(topics) = &spec.topics {
        for (routing_key, queues) in topics {
            for queue in queues.names() {
                bindings.push((routing_key.clone(), queue.to_owned()));
            }
        }
    } else if let Some(direct) = &spec.direct {
        for (routing_key, queues) in direct {
            for queue in queues.names() {
                bindings.push((routing_key.clone(), queue.to_owned()));
            }
        }
    } else if let Some(fanout) = &spec.fanout {
        for queue in fanout {
            bindings.push((String::new(), queue.clone()));
        }
    }

    let binding_tasks: Vec<_> = bindings
        .into_iter()
        .map(|(routing_key, queue_name)| {
            let core = Arc::clone(core);
            let exchange = Arc::clone(&exchange);
            async move {
                let queue = core.queue(&queue_name).await;
                queue.assert().await?;
                exchange.bind(&queue.effective_name().await, &routing_key).await
            }
        })
        .collect();
    for result in join_all(binding_tasks).await {
        result?;
    }

    Ok(())
}
