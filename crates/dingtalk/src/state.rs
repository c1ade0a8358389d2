use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tokio_util::sync::CancellationToken;

use crate::{
    cards::{CardClient, CardRegistry, CardThrottle},
    client::DingTalkClient,
    config::DingTalkAccountConfig,
    merge::MergeBuffer,
    outbound::DingTalkSender,
};

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, AccountState>>>;

/// Per-account runtime state.
pub struct AccountState {
    pub account_id: String,
    pub config: DingTalkAccountConfig,
    pub client: DingTalkClient,
    pub sender: DingTalkSender,
    /// Present only in card mode.
    pub cards: Option<CardClient>,
    pub registry: Arc<CardRegistry>,
    pub throttle: CardThrottle,
    pub merge: MergeBuffer,
    /// Parent of every task spawned for this account.
    pub cancel: CancellationToken,
}
