//! Forkline chain organizer module for Caryatid
//! Decides the canonical chain from blocks that arrive in any order

pub mod candidate_block;
pub mod orphan_pool;
pub mod organizer;
pub mod organizer_error;
pub mod reorganization;

use anyhow::Result;
use caryatid_sdk::{module, Context};
use config::Config;
use forkline_common::{
    configuration::{genesis_from_config, max_future_drift_from_config},
    messages::{BlockStatusMessage, ChainReorganizedMessage, Message},
    validation::HeaderValidator,
    BlockHash, BlockStatus,
};
use forkline_module_chain_store::open_store;
use candidate_block::CandidateBlock;
use orphan_pool::{EvictionPolicy, OrphanPool, DEFAULT_CAPACITY};
use organizer::{Organizer, StoreReport};
use reorganization::{EventQueue, QueueSink, ReorganizationEvent};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, Instrument};

const DEFAULT_SUBSCRIBE_BLOCKS_TOPIC: &str = "forkline.block.available";
const DEFAULT_PUBLISH_REORGANIZATIONS_TOPIC: &str = "forkline.chain.reorganized";
const DEFAULT_PUBLISH_STATUS_TOPIC: &str = "forkline.block.status";
const DEFAULT_ORPHAN_EVICTION: &str = "reject-newest";

/// Chain organizer module
/// Parameterised by the outer message enum used on the bus
#[module(
    message_type(Message),
    name = "chain-organizer",
    description = "Fork choice and chain reorganization"
)]
pub struct ChainOrganizer;

impl ChainOrganizer {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        // Get configuration
        let subscribe_blocks_topic = config
            .get_string("subscribe-blocks-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_BLOCKS_TOPIC.to_string());
        info!("Creating blocks subscriber on '{subscribe_blocks_topic}'");

        let publish_reorganizations_topic = config
            .get_string("publish-reorganizations-topic")
            .unwrap_or(DEFAULT_PUBLISH_REORGANIZATIONS_TOPIC.to_string());
        info!("Publishing reorganizations on '{publish_reorganizations_topic}'");

        let publish_status_topic = config
            .get_string("publish-status-topic")
            .unwrap_or(DEFAULT_PUBLISH_STATUS_TOPIC.to_string());
        info!("Publishing block status on '{publish_status_topic}'");

        let capacity = config
            .get_int("orphan-pool-capacity")
            .unwrap_or(DEFAULT_CAPACITY as i64)
            .max(0) as usize;
        let eviction: EvictionPolicy = config
            .get_string("orphan-eviction")
            .unwrap_or(DEFAULT_ORPHAN_EVICTION.to_string())
            .parse()?;
        info!("Orphan pool capacity {capacity}, eviction {eviction}");

        let max_future_drift = max_future_drift_from_config(&config);
        info!("Max future drift {max_future_drift}s");

        let genesis = genesis_from_config(&config)?;
        info!("Genesis block {}", genesis.hash());

        let chain = open_store(&config, genesis)?;

        // Create the organizer with a queue-based sink
        let event_queue: EventQueue = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Box::new(QueueSink::new(event_queue.clone()));
        let mut organizer = Organizer::new(
            OrphanPool::new(capacity, eviction),
            chain,
            Box::new(HeaderValidator::new(max_future_drift)),
            sink,
        );
        organizer.start()?;

        let mut block_subscription = context.subscribe(&subscribe_blocks_topic).await?;

        context.clone().run(async move {
            loop {
                let Ok((_, message)) = block_subscription.read().await else {
                    error!("Block message read failed");
                    organizer.stop();
                    return;
                };

                match message.as_ref() {
                    Message::BlockAvailable(available) => {
                        let hash = available.block.hash();
                        let span = info_span!("chain_organizer", block = %hash);

                        async {
                            // Pool mutation stays on this task however many publishers there are
                            let statuses = match organizer.store(available.block.clone()) {
                                Ok(report) => collect_statuses(&report),
                                Err(e) => {
                                    error!("Failed to organize block {hash}: {e}");
                                    rejected_statuses(&organizer.take_rejected(), None)
                                }
                            };

                            // Events emitted before a failure are still published
                            let messages = collect_messages(
                                &event_queue,
                                &publish_reorganizations_topic,
                                &publish_status_topic,
                                statuses,
                            );
                            publish_messages(&context, messages).await;
                        }
                        .instrument(span)
                        .await;
                    }

                    _ => debug!("Ignoring non-BlockAvailable message on blocks topic"),
                }
            }
        });

        Ok(())
    }
}

/// Status of the stored block plus every block rejected along the way.
fn collect_statuses(report: &StoreReport) -> Vec<(BlockHash, BlockStatus)> {
    let mut statuses = vec![(report.hash, report.status.clone())];
    statuses.extend(rejected_statuses(&report.summary.rejected, Some(&report.hash)));
    statuses
}

/// `Rejected` statuses for `rejected`, leaving out `skip`.
fn rejected_statuses(
    rejected: &[CandidateBlock],
    skip: Option<&BlockHash>,
) -> Vec<(BlockHash, BlockStatus)> {
    rejected
        .iter()
        .filter(|candidate| skip != Some(&candidate.hash()))
        .filter_map(|candidate| {
            let reason = candidate.failure_reason()?.clone();
            Some((candidate.hash(), BlockStatus::Rejected { reason }))
        })
        .collect()
}

/// Drain sink events and resolve them, with block statuses, into
/// publishable messages. Reorganizations go first, in order.
fn collect_messages(
    event_queue: &EventQueue,
    publish_reorganizations_topic: &str,
    publish_status_topic: &str,
    statuses: Vec<(BlockHash, BlockStatus)>,
) -> Vec<(String, Arc<Message>)> {
    let events: Vec<ReorganizationEvent> = event_queue.lock().unwrap().drain(..).collect();
    let mut messages = Vec::with_capacity(events.len() + statuses.len());

    for event in events {
        let msg = Arc::new(Message::ChainReorganized(ChainReorganizedMessage::from(
            event,
        )));
        messages.push((publish_reorganizations_topic.to_string(), msg));
    }

    for (hash, status) in statuses {
        let msg = Arc::new(Message::BlockStatus(BlockStatusMessage { hash, status }));
        messages.push((publish_status_topic.to_string(), msg));
    }

    messages
}

/// Publish a batch of collected messages to the bus.
async fn publish_messages(context: &Arc<Context<Message>>, messages: Vec<(String, Arc<Message>)>) {
    for (topic, msg) in messages {
        context
            .message_bus
            .publish(&topic, msg)
            .await
            .unwrap_or_else(|e| error!("Failed to publish to {topic}: {e}"));
    }
}
