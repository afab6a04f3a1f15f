//! Transaction requests, outcomes and recurring schedules

use super::address::{Address, AddressKind};
use super::amount::Amount;
use crate::error::WalletError;
use crate::node::config::Network;
use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// Memo field size on a Sapling output
pub const MAX_MEMO_BYTES: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub address: Address,
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl Recipient {
    pub fn new(address: Address, amount: Amount) -> Self {
        Self {
            address,
            amount,
            memo: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Memo as the node expects it: hex of the UTF-8 bytes
    pub fn encoded_memo(&self) -> Option<String> {
        self.memo
            .as_deref()
            .filter(|memo| !memo.is_empty())
            .map(|memo| hex::encode(memo.as_bytes()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", content = "amount", rename_all = "camelCase")]
pub enum Fee {
    /// Ask the node for an estimate
    #[default]
    Default,
    Explicit(Amount),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ChangePolicy {
    /// Change returns to the source address
    #[default]
    ToSameType,
    /// Change goes to the wallet's designated shielded address
    ToShieldedAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    /// `None` spends from whatever the wallet holds
    #[serde(default)]
    pub from_address: Option<Address>,
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub fee: Fee,
    #[serde(default)]
    pub change_policy: ChangePolicy,
}

impl TransactionRequest {
    pub fn new(recipients: Vec<Recipient>) -> Self {
        Self {
            from_address: None,
            recipients,
            fee: Fee::Default,
            change_policy: ChangePolicy::ToSameType,
        }
    }

    pub fn from(mut self, address: Address) -> Self {
        self.from_address = Some(address);
        self
    }

    pub fn with_fee(mut self, fee: Fee) -> Self {
        self.fee = fee;
        self
    }

    pub fn with_change_policy(mut self, policy: ChangePolicy) -> Self {
        self.change_policy = policy;
        self
    }

    /// Sum of recipient amounts, `None` if it overflows the money range
    pub fn total(&self) -> Option<Amount> {
        Amount::checked_sum(self.recipients.iter().map(|r| r.amount))
    }

    /// Checks that need no node: addresses, memos, amounts. The first
    /// failure wins and names the offending field.
    pub fn validate(&self, network: Network) -> Result<(), WalletError> {
        if self.recipients.is_empty() {
            return Err(WalletError::validation(
                "recipients",
                "at least one recipient is required",
            ));
        }

        if let Some(from) = &self.from_address {
            check_address("fromAddress", from, network)?;
        }
        for (i, recipient) in self.recipients.iter().enumerate() {
            check_address(&format!("recipients[{}].address", i), &recipient.address, network)?;
        }

        for (i, recipient) in self.recipients.iter().enumerate() {
            let Some(memo) = recipient.memo.as_deref().filter(|m| !m.is_empty()) else {
                continue;
            };
            let field = format!("recipients[{}].memo", i);
            match recipient.address.kind() {
                AddressKind::Transparent => {
                    return Err(WalletError::validation(
                        &field,
                        "memo not allowed for transparent address",
                    ))
                }
                AddressKind::Shielded if memo.len() > MAX_MEMO_BYTES => {
                    return Err(WalletError::validation(
                        &field,
                        format!("memo is {} bytes, the limit is {}", memo.len(), MAX_MEMO_BYTES),
                    ))
                }
                AddressKind::Shielded => {}
            }
        }

        for (i, recipient) in self.recipients.iter().enumerate() {
            if recipient.amount.is_zero() {
                return Err(WalletError::validation(
                    &format!("recipients[{}].amount", i),
                    "amount must be positive",
                ));
            }
        }
        if self.total().is_none() {
            return Err(WalletError::validation(
                "recipients",
                "total amount exceeds the maximum supply",
            ));
        }

        Ok(())
    }
}

/// The address variant must agree with what its text parses as, and belong
/// to the wallet's network
fn check_address(field: &str, address: &Address, network: Network) -> Result<(), WalletError> {
    let parsed = Address::parse_for(address.as_str(), network)
        .map_err(|e| WalletError::validation(field, e.to_string()))?;
    if parsed.kind() != address.kind() {
        let claimed = match address.kind() {
            AddressKind::Transparent => "transparent",
            AddressKind::Shielded => "shielded",
        };
        return Err(WalletError::validation(
            field,
            format!("{} is not a {} address", address, claimed),
        ));
    }
    Ok(())
}

/// Final or in-flight state of a submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TransactionOutcome {
    #[serde(rename_all = "camelCase")]
    Pending { request_id: u64 },
    Success { txid: String },
    Failed { reason: String },
}

impl TransactionOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionOutcome::Pending { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
}

/// A payment repeated on a calendar interval. Firing is up to the owner;
/// this only tracks dates and counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecurringSchedule {
    pub template: TransactionRequest,
    pub start_date: NaiveDate,
    pub interval: IntervalUnit,
    pub total_occurrences: u32,
    #[serde(default)]
    pub occurrences_sent: u32,
}

impl RecurringSchedule {
    pub fn new(
        template: TransactionRequest,
        start_date: NaiveDate,
        interval: IntervalUnit,
        total_occurrences: u32,
    ) -> Self {
        Self {
            template,
            start_date,
            interval,
            total_occurrences,
            occurrences_sent: 0,
        }
    }

    /// Date of the n-th payment (0-based). Monthly dates keep the start
    /// day, clamped to the end of shorter months.
    pub fn due_date(&self, occurrence: u32) -> Option<NaiveDate> {
        match self.interval {
            IntervalUnit::Day => self.start_date.checked_add_days(Days::new(occurrence as u64)),
            IntervalUnit::Week => self
                .start_date
                .checked_add_days(Days::new(7 * occurrence as u64)),
            IntervalUnit::Month => self.start_date.checked_add_months(Months::new(occurrence)),
        }
    }

    /// Date of the next unsent payment
    pub fn next_due(&self) -> Option<NaiveDate> {
        if self.is_complete() {
            return None;
        }
        self.due_date(self.occurrences_sent)
    }

    pub fn is_due(&self, today: NaiveDate) -> bool {
        self.next_due().is_some_and(|due| due <= today)
    }

    /// A fresh request for the next payment
    pub fn instantiate(&self) -> Option<TransactionRequest> {
        (!self.is_complete()).then(|| self.template.clone())
    }

    pub fn record_sent(&mut self) {
        if !self.is_complete() {
            self.occurrences_sent += 1;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.occurrences_sent >= self.total_occurrences
    }

    pub fn remaining(&self) -> u32 {
        self.total_occurrences.saturating_sub(self.occurrences_sent)
    }
}
