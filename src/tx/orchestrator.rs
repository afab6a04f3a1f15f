//! Transaction orchestration
//!
//! [`TransactionOrchestrator::submit`] runs every check it can without the
//! node, then hands back a [`PendingHandle`] while a background task
//! resolves the fee, picks the funding source, starts `z_sendmany` and
//! polls the operation until it finishes.

use super::address::{Address, AddressKind};
use super::amount::Amount;
use super::request::{ChangePolicy, Fee, TransactionOutcome, TransactionRequest};
use crate::error::WalletError;
use crate::events::{ErrorEvent, SharedEventSink, WalletEvent};
use crate::node::config::Network;
use crate::node::rpc::{AddressBalances, NodeRpc, OperationStatus, SendOutput};
use crate::node::session::{RpcWatch, SessionHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Fee used when the node has no estimate
pub const DEFAULT_FEE: u64 = 10_000;

/// Consecutive failed status polls tolerated while an operation computes
const STATUS_POLL_FAILURES: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub network: Network,
    /// Fees are public, so a non-default fee can fingerprint the sender
    pub allow_custom_fees: bool,
    /// Destination for change under [`ChangePolicy::ToShieldedAddress`]
    pub shielded_change_address: Option<Address>,
    /// Operation polling cadence, same as the session's status polling
    pub poll_interval: Duration,
    pub min_conf: u32,
    /// Lower bound for default fees, also used for the pre-submit funds check
    pub minimum_fee: Amount,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            allow_custom_fees: false,
            shielded_change_address: None,
            poll_interval: Duration::from_secs(2),
            min_conf: 1,
            minimum_fee: Amount::from_minor(DEFAULT_FEE).unwrap_or(Amount::ZERO),
        }
    }
}

/// Confirmed balances the funds checks run against
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceSnapshot {
    balances: AddressBalances,
}

impl BalanceSnapshot {
    pub fn new(balances: AddressBalances) -> Self {
        Self { balances }
    }

    pub fn balance_of(&self, address: &str) -> Amount {
        self.balances.get(address).copied().unwrap_or(Amount::ZERO)
    }

    pub fn total(&self) -> Amount {
        self.balances
            .values()
            .fold(Amount::ZERO, |acc, amount| acc.checked_add(*amount).unwrap_or(acc))
    }

    /// Non-empty balances, largest first
    fn by_size(&self) -> Vec<(&str, Amount)> {
        let mut entries: Vec<_> = self
            .balances
            .iter()
            .filter(|(_, amount)| !amount.is_zero())
            .map(|(address, amount)| (address.as_str(), *amount))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }

    /// Take a dispatched send off its source
    fn debit(&mut self, address: &str, amount: Amount) {
        if let Some(balance) = self.balances.get_mut(address) {
            *balance = balance.checked_sub(amount).unwrap_or(Amount::ZERO);
        }
    }

    /// Give back what a failed send had taken
    fn credit(&mut self, address: &str, amount: Amount) {
        let balance = self.balances.entry(address.to_string()).or_insert(Amount::ZERO);
        *balance = balance.checked_add(amount).unwrap_or(*balance);
    }

    /// After a sweep only `target` holds the merged funds
    fn merge(&mut self, sources: &[String], target: &str, merged: Amount) {
        for source in sources {
            self.balances.remove(source);
        }
        self.balances.insert(target.to_string(), merged);
    }

    /// Largest single address of `kind` holding at least `needed`
    fn largest_covering(&self, needed: Amount, kind: AddressKind) -> Option<(&str, Amount)> {
        self.by_size().into_iter().find(|(address, amount)| {
            *amount >= needed && Address::parse(address).map(|a| a.kind()) == Ok(kind)
        })
    }
}

/// Where the money for a payment comes from
#[derive(Debug, Clone, PartialEq)]
enum Funding {
    Direct { source: String, balance: Amount },
    /// Merge `sources` into `target` first, then pay from `target`
    Sweep {
        sources: Vec<String>,
        target: String,
        merged: Amount,
    },
}

impl Funding {
    fn source(&self) -> &str {
        match self {
            Funding::Direct { source, .. } => source,
            Funding::Sweep { target, .. } => target,
        }
    }

    fn available(&self) -> Amount {
        match self {
            Funding::Direct { balance, .. } => *balance,
            Funding::Sweep { merged, .. } => *merged,
        }
    }
}

fn insufficient(have: Amount, need: Amount) -> WalletError {
    WalletError::validation(
        "fromAddress",
        format!("insufficient confirmed balance: have {}, need {}", have, need),
    )
}

/// Recipients plus fee must fit the source (or the whole wallet)
fn check_funds(snapshot: &BalanceSnapshot, request: &TransactionRequest, fee: Amount) -> Result<(), WalletError> {
    let needed = request
        .total()
        .and_then(|total| total.checked_add(fee))
        .ok_or_else(|| WalletError::validation("recipients", "total amount exceeds the maximum supply"))?;
    let available = match &request.from_address {
        Some(from) => snapshot.balance_of(from.as_str()),
        None => snapshot.total(),
    };
    if available < needed {
        return Err(insufficient(available, needed));
    }
    Ok(())
}

/// Pick the funding source. Without a from address, prefer the largest
/// covering shielded address, then transparent, else sweep.
fn plan_funding(snapshot: &BalanceSnapshot, request: &TransactionRequest, fee: Amount) -> Result<Funding, WalletError> {
    check_funds(snapshot, request, fee)?;
    let needed = request
        .total()
        .and_then(|total| total.checked_add(fee))
        .ok_or_else(|| WalletError::validation("recipients", "total amount exceeds the maximum supply"))?;

    if let Some(from) = &request.from_address {
        return Ok(Funding::Direct {
            source: from.as_str().to_string(),
            balance: snapshot.balance_of(from.as_str()),
        });
    }

    for kind in [AddressKind::Shielded, AddressKind::Transparent] {
        if let Some((source, balance)) = snapshot.largest_covering(needed, kind) {
            return Ok(Funding::Direct {
                source: source.to_string(),
                balance,
            });
        }
    }

    // The merge costs its own fee
    let needed_with_merge = needed
        .checked_add(fee)
        .ok_or_else(|| insufficient(snapshot.total(), needed))?;

    let mut picked: Vec<(&str, Amount)> = Vec::new();
    let mut sum = Amount::ZERO;
    for (address, amount) in snapshot.by_size() {
        picked.push((address, amount));
        sum = sum.checked_add(amount).unwrap_or(sum);
        if sum >= needed_with_merge {
            break;
        }
    }
    if sum < needed_with_merge || picked.len() < 2 {
        return Err(insufficient(sum, needed_with_merge));
    }

    let target = picked[0].0.to_string();
    let sources = picked[1..].iter().map(|(a, _)| a.to_string()).collect();
    Ok(Funding::Sweep {
        sources,
        target,
        merged: sum.checked_sub(fee).unwrap_or(Amount::ZERO),
    })
}

/// Receiver side of one submission
pub struct PendingHandle {
    request_id: u64,
    receiver: oneshot::Receiver<TransactionOutcome>,
    abandoned: Arc<AtomicBool>,
}

impl PendingHandle {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wait for the terminal outcome
    pub async fn outcome(self) -> TransactionOutcome {
        self.receiver.await.unwrap_or_else(|_| TransactionOutcome::Failed {
            reason: "submission task ended without a result".to_string(),
        })
    }

    /// Stop delivery of the outcome. The node-side operation is not
    /// cancelled and may still broadcast.
    pub fn abandon(self) {
        log::info!("Transaction request {} abandoned", self.request_id);
        self.abandoned.store(true, Ordering::SeqCst);
    }
}

pub struct TransactionOrchestrator {
    rpc: RpcWatch,
    config: OrchestratorConfig,
    balances: Arc<RwLock<Option<BalanceSnapshot>>>,
    next_id: AtomicU64,
    events: SharedEventSink,
}

impl TransactionOrchestrator {
    /// Submissions use whichever client `rpc` holds when they start
    pub fn new(rpc: RpcWatch, config: OrchestratorConfig, events: SharedEventSink) -> Self {
        Self {
            rpc,
            config,
            balances: Arc::new(RwLock::new(None)),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Follow the session's client, so reconnects and new credentials
    /// carry over to later submissions
    pub fn for_session(session: &SessionHandle, config: OrchestratorConfig, events: SharedEventSink) -> Self {
        Self::new(session.subscribe_rpc(), config, events)
    }

    /// Always use one fixed client
    pub fn with_client(rpc: Arc<dyn NodeRpc>, config: OrchestratorConfig, events: SharedEventSink) -> Self {
        let (_, receiver) = watch::channel(Some(rpc));
        Self::new(receiver, config, events)
    }

    fn current_rpc(&self) -> Result<Arc<dyn NodeRpc>, WalletError> {
        self.rpc
            .borrow()
            .clone()
            .ok_or_else(|| WalletError::Network("no node connection yet".to_string()))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn set_balances(&self, snapshot: BalanceSnapshot) {
        if let Ok(mut guard) = self.balances.write() {
            *guard = Some(snapshot);
        }
    }

    pub fn balances(&self) -> Option<BalanceSnapshot> {
        self.balances.read().ok().and_then(|guard| guard.clone())
    }

    /// Reload the snapshot from the node
    pub async fn refresh_balances(&self) -> Result<BalanceSnapshot, WalletError> {
        let snapshot = BalanceSnapshot::new(self.current_rpc()?.address_balances().await?);
        self.set_balances(snapshot.clone());
        Ok(snapshot)
    }

    /// Validate and start a submission. Validation failures return here,
    /// before any node call.
    pub fn submit(&self, request: TransactionRequest) -> Result<PendingHandle, WalletError> {
        request.validate(self.config.network)?;

        if let Fee::Explicit(_) = request.fee {
            if !self.config.allow_custom_fees {
                return Err(WalletError::validation(
                    "fee",
                    "custom fees are disabled; enable them in settings to set a fee",
                ));
            }
        }

        let change_address = match request.change_policy {
            ChangePolicy::ToSameType => None,
            ChangePolicy::ToShieldedAddress => match &self.config.shielded_change_address {
                Some(address) => Some(address.as_str().to_string()),
                None => {
                    return Err(WalletError::validation(
                        "changePolicy",
                        "no shielded change address is configured",
                    ))
                }
            },
        };

        let floor = match request.fee {
            Fee::Explicit(fee) => fee,
            Fee::Default => self.config.minimum_fee,
        };
        if let Some(snapshot) = self.balances() {
            check_funds(&snapshot, &request, floor)?;
        }
        let rpc = self.current_rpc()?;

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let abandoned = Arc::new(AtomicBool::new(false));

        log::info!(
            "Submitting transaction request {} to {} recipient(s)",
            request_id,
            request.recipients.len()
        );
        self.events.emit(WalletEvent::TransactionOutcome {
            request_id,
            outcome: TransactionOutcome::Pending { request_id },
        });

        let job = Submission {
            request_id,
            request,
            change_address,
            rpc,
            config: self.config.clone(),
            balances: self.balances.clone(),
            events: self.events.clone(),
        };
        let flag = abandoned.clone();
        tokio::spawn(async move {
            let outcome = match job.run().await {
                Ok(txid) => TransactionOutcome::Success { txid },
                Err(err) => {
                    if !flag.load(Ordering::SeqCst) {
                        job.events.emit(WalletEvent::Error(ErrorEvent::from(&err)));
                    }
                    TransactionOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };

            if flag.load(Ordering::SeqCst) {
                log::info!("Dropping outcome of abandoned request {}", job.request_id);
                return;
            }
            log::info!("Transaction request {} finished: {:?}", job.request_id, outcome);
            job.events.emit(WalletEvent::TransactionOutcome {
                request_id: job.request_id,
                outcome: outcome.clone(),
            });
            let _ = sender.send(outcome);
        });

        Ok(PendingHandle {
            request_id,
            receiver,
            abandoned,
        })
    }
}

/// One submission's RPC sequence, run on its own task
struct Submission {
    request_id: u64,
    request: TransactionRequest,
    change_address: Option<String>,
    rpc: Arc<dyn NodeRpc>,
    config: OrchestratorConfig,
    balances: Arc<RwLock<Option<BalanceSnapshot>>>,
    events: SharedEventSink,
}

impl Submission {
    async fn run(&self) -> Result<String, WalletError> {
        let fee = self.resolve_fee().await;
        let snapshot = self.snapshot().await?;
        let funding = plan_funding(&snapshot, &self.request, fee)?;

        let min_conf = match &funding {
            Funding::Direct { .. } => self.config.min_conf,
            Funding::Sweep { sources, target, .. } => {
                log::info!("Sweeping {} address(es) into {}", sources.len(), target);
                let opid = self.rpc.merge_to_address(sources, target, fee).await?;
                self.wait_for_operation(&opid).await?;
                let merged = funding.available();
                self.update_balances(|snapshot| snapshot.merge(sources, target, merged));
                // The merged funds are not confirmed yet
                0
            }
        };

        let outputs = self.outputs(&funding, fee)?;
        let opid = self
            .rpc
            .send_many(funding.source(), &outputs, min_conf, fee)
            .await?;

        // Later funds checks must not count this money again
        let spent = Amount::checked_sum(outputs.iter().map(|output| output.amount))
            .and_then(|total| total.checked_add(fee))
            .unwrap_or_else(|| funding.available());
        self.update_balances(|snapshot| snapshot.debit(funding.source(), spent));

        let result = self.wait_for_operation(&opid).await;
        if let Err(WalletError::Submission(_)) = &result {
            self.update_balances(|snapshot| snapshot.credit(funding.source(), spent));
        }
        result
    }

    fn update_balances(&self, update: impl FnOnce(&mut BalanceSnapshot)) {
        if let Ok(mut guard) = self.balances.write() {
            if let Some(snapshot) = guard.as_mut() {
                update(snapshot);
            }
        }
    }

    async fn resolve_fee(&self) -> Amount {
        match self.request.fee {
            Fee::Explicit(fee) => fee,
            Fee::Default => {
                let estimate = match self.rpc.estimate_fee().await {
                    Ok(estimate) => estimate,
                    Err(e) => {
                        log::warn!("Fee estimation failed, using default fee: {}", e);
                        None
                    }
                };
                let fallback = Amount::from_minor(DEFAULT_FEE).unwrap_or(Amount::ZERO);
                estimate.unwrap_or(fallback).max(self.config.minimum_fee)
            }
        }
    }

    async fn snapshot(&self) -> Result<BalanceSnapshot, WalletError> {
        let cached = self.balances.read().ok().and_then(|guard| guard.clone());
        match cached {
            Some(snapshot) => Ok(snapshot),
            None => {
                let snapshot = BalanceSnapshot::new(self.rpc.address_balances().await?);
                if let Ok(mut guard) = self.balances.write() {
                    *guard = Some(snapshot.clone());
                }
                Ok(snapshot)
            }
        }
    }

    fn outputs(&self, funding: &Funding, fee: Amount) -> Result<Vec<SendOutput>, WalletError> {
        let mut outputs: Vec<SendOutput> = self
            .request
            .recipients
            .iter()
            .map(|recipient| SendOutput {
                address: recipient.address.as_str().to_string(),
                amount: recipient.amount,
                memo: recipient.encoded_memo(),
            })
            .collect();

        if let Some(change_address) = self.change_address.as_deref() {
            // Change already lands on the source when it is the change address
            if change_address != funding.source() {
                let spent = self
                    .request
                    .total()
                    .and_then(|total| total.checked_add(fee))
                    .unwrap_or(Amount::ZERO);
                let change = funding
                    .available()
                    .checked_sub(spent)
                    .ok_or_else(|| insufficient(funding.available(), spent))?;
                if !change.is_zero() {
                    outputs.push(SendOutput {
                        address: change_address.to_string(),
                        amount: change,
                        memo: None,
                    });
                }
            }
        }
        Ok(outputs)
    }

    /// Poll an async node operation to its end
    async fn wait_for_operation(&self, opid: &str) -> Result<String, WalletError> {
        self.events.emit(WalletEvent::TransactionComputing {
            request_id: self.request_id,
            operation_id: opid.to_string(),
        });

        let mut failures = 0;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            match self.rpc.operation_status(opid).await {
                Ok(OperationStatus::Success { txid }) => return Ok(txid),
                Ok(OperationStatus::Failed { message }) => return Err(WalletError::Submission(message)),
                Ok(OperationStatus::Queued) | Ok(OperationStatus::Executing) => failures = 0,
                Err(e) => {
                    failures += 1;
                    log::warn!("Status of operation {} unavailable: {}", opid, e);
                    if failures >= STATUS_POLL_FAILURES {
                        return Err(e.into());
                    }
                }
            }
        }
    }
}
