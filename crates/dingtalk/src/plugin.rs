use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    tokio::sync::mpsc::UnboundedReceiver,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use dingbridge_channels::{
    ChannelRuntime,
    plugin::{
        ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin, ChannelStatus,
        ChannelStreamOutbound,
    },
};

use crate::{
    CHANNEL_ID,
    auth::TokenCache,
    cards::{CardClient, CardRegistry, CardThrottle, CardUpdater},
    client::DingTalkClient,
    config::{self, DingTalkAccountConfig, MessageMode},
    merge::{MergeBuffer, MergeConfig, MergedBatch, SWEEP_INTERVAL},
    outbound::{DingTalkOutbound, DingTalkSender},
    pipeline::InboundPipeline,
    retry::RetryPolicy,
    state::{AccountState, AccountStateMap},
    stream::StreamConnection,
};

/// DingTalk channel plugin.
pub struct DingTalkPlugin {
    accounts: AccountStateMap,
    outbound: DingTalkOutbound,
    runtime: Option<Arc<dyn ChannelRuntime>>,
    http: reqwest::Client,
    tokens: Arc<TokenCache>,
}

impl DingTalkPlugin {
    pub fn new() -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let outbound = DingTalkOutbound {
            accounts: Arc::clone(&accounts),
        };
        let http = reqwest::Client::new();
        Self {
            accounts,
            outbound,
            runtime: None,
            tokens: Arc::new(TokenCache::new(http.clone(), RetryPolicy::default())),
            http,
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ChannelRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn shared_outbound(&self) -> Arc<dyn ChannelOutbound> {
        Arc::new(DingTalkOutbound {
            accounts: Arc::clone(&self.accounts),
        })
    }

    pub fn shared_stream_outbound(&self) -> Arc<dyn ChannelStreamOutbound> {
        Arc::new(DingTalkOutbound {
            accounts: Arc::clone(&self.accounts),
        })
    }

    /// Account ids declared in a channel config object.
    pub fn configured_account_ids(config: &serde_json::Value) -> Vec<String> {
        config::list_account_ids(config)
    }

    /// List all running account ids.
    pub fn account_ids(&self) -> Vec<String> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = accounts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_account(&self, account_id: &str) -> bool {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.contains_key(account_id)
    }

    /// Get the config for a specific account (serialized to JSON).
    pub fn account_config(&self, account_id: &str) -> Option<serde_json::Value> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .and_then(|s| serde_json::to_value(&s.config).ok())
    }

    fn build_state(
        &self,
        account_id: &str,
        config: DingTalkAccountConfig,
        runtime: Arc<dyn ChannelRuntime>,
    ) -> (AccountState, InboundPipeline, UnboundedReceiver<MergedBatch>) {
        let cancel = CancellationToken::new();
        let client = DingTalkClient::new(self.http.clone(), Arc::clone(&self.tokens), &config);
        let sender = DingTalkSender::new(client.clone(), config.locale);

        let card_client = CardClient::new(
            client.clone(),
            config.card_template_id.clone().unwrap_or_default(),
        );
        let cards = (config.message_mode == MessageMode::Card).then(|| card_client.clone());
        let registry = Arc::new(CardRegistry::new(config.card_ttl(), cancel.child_token()));
        let throttle = CardThrottle::new(
            Arc::new(card_client) as Arc<dyn CardUpdater>,
            Arc::clone(&registry),
            config.card_throttle(),
            config.card_inactivity(),
        );
        let (merge, batches) = MergeBuffer::new(MergeConfig::from(&config), cancel.child_token());

        let pipeline = InboundPipeline::new(
            account_id,
            config.clone(),
            runtime,
            sender.clone(),
            cards.clone(),
            Arc::clone(&registry),
            throttle.clone(),
        );
        let state = AccountState {
            account_id: account_id.to_string(),
            config,
            client,
            sender,
            cards,
            registry,
            throttle,
            merge,
            cancel,
        };
        (state, pipeline, batches)
    }
}

impl Default for DingTalkPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelPlugin for DingTalkPlugin {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "DingTalk"
    }

    fn validate_config(&self, config: &serde_json::Value) -> Result<()> {
        let parsed: DingTalkAccountConfig = serde_json::from_value(config.clone())?;
        parsed.validate()?;
        Ok(())
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let config: DingTalkAccountConfig = serde_json::from_value(config)?;
        config.validate()?;
        let runtime = self
            .runtime
            .clone()
            .ok_or_else(|| dingbridge_channels::Error::unavailable("dingtalk host runtime not set"))?;

        if self.has_account(account_id) {
            warn!(account_id, "dingtalk account already running, restarting");
            self.stop_account(account_id).await?;
        }

        info!(account_id, mode = ?config.message_mode, "starting dingtalk account");

        let (state, pipeline, mut batches) = self.build_state(account_id, config, runtime);
        state.registry.spawn_sweeper(state.config.card_sweep_interval());
        state.merge.spawn_sweeper(SWEEP_INTERVAL);
        StreamConnection::new(account_id, state.client.clone(), state.merge.clone())
            .spawn(state.cancel.clone());

        let cancel = state.cancel.clone();
        let id = account_id.to_string();
        tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = batches.recv() => batch,
                };
                let Some(batch) = batch else {
                    break;
                };
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    if let Ok(outcome) = pipeline.process(batch).await {
                        debug!(?outcome, "inbound batch processed");
                    }
                });
            }
            debug!(account_id = %id, "dingtalk dispatcher stopped");
        });

        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        accounts.insert(account_id.to_string(), state);
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> Result<()> {
        let state = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.remove(account_id)
        };

        match state {
            Some(state) => {
                info!(account_id, "stopping dingtalk account");
                state.cancel.cancel();
                state.throttle.shutdown();
                state.merge.clear();
            },
            None => warn!(account_id, "dingtalk account not found"),
        }
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(&self.outbound)
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for DingTalkPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        let parts = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            accounts.get(account_id).map(|s| {
                (
                    s.client.clone(),
                    s.throttle.active_count(),
                    s.merge.open_entries(),
                )
            })
        };

        let snapshot = match parts {
            Some((client, active_cards, open_merges)) => match client.access_token().await {
                Ok(_) => ChannelHealthSnapshot {
                    connected: true,
                    account_id: account_id.to_string(),
                    details: Some(format!(
                        "active cards: {active_cards}, open merges: {open_merges}"
                    )),
                },
                Err(e) => ChannelHealthSnapshot {
                    connected: false,
                    account_id: account_id.to_string(),
                    details: Some(format!("token error: {e}")),
                },
            },
            None => ChannelHealthSnapshot {
                connected: false,
                account_id: account_id.to_string(),
                details: Some("account not started".into()),
            },
        };
        Ok(snapshot)
    }
}
