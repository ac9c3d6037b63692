// Domain models for the economy ledger.
//
// Nothing here knows about Discord or SQL. Commands and stores translate to
// and from these types at their own boundaries.

use super::amount::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EconomyError {
    /// The store was unreachable or a statement failed. Balances are never
    /// left partially updated when this is returned.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("No balance record for account {account} in currency {currency}")]
    AccountNotFound { account: String, currency: String },

    #[error("Currency not found: {0}")]
    CurrencyNotFound(String),

    #[error("Insufficient funds: need {required}, but only have {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    #[error("{0} can't be transferred")]
    NonTransferableCurrency(String),

    /// Registry invariant violated. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid amount: {0:?}")]
    InvalidAmount(String),

    #[error("Invalid account identity: {0:?}")]
    InvalidIdentity(String),

    #[error("Player accounts take their display name from the player")]
    RenameNotAllowed,
}

impl EconomyError {
    pub(crate) fn account_not_found(account: &AccountId, currency: CurrencyId) -> Self {
        EconomyError::AccountNotFound {
            account: account.to_string(),
            currency: currency.to_string(),
        }
    }
}

// ============================================================================
// CURRENCIES
// ============================================================================

/// Storage-assigned currency id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CurrencyId(pub i64);

impl fmt::Display for CurrencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub id: CurrencyId,
    pub name_singular: String,
    pub name_plural: String,
    pub symbol: String,
    pub is_default: bool,
    pub is_transferable: bool,
    pub starting_balance: Amount,
}

impl Currency {
    /// Render an amount with this currency's symbol, e.g. `$12.50`.
    pub fn format(&self, amount: Amount) -> String {
        format!("{}{}", self.symbol, amount)
    }

    /// Singular or plural name, whichever reads right for `amount`.
    pub fn display_name_for(&self, amount: Amount) -> &str {
        if amount.as_decimal() == rust_decimal::Decimal::ONE {
            &self.name_singular
        } else {
            &self.name_plural
        }
    }
}

// ============================================================================
// ACCOUNTS
// ============================================================================

/// Who an account belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    /// A real player, identified by their unique id.
    Player(Uuid),
    /// A named account not backed by a player (a bank, a shop, a job pool).
    Virtual(String),
}

impl AccountKind {
    /// Validate a virtual account name.
    ///
    /// Names must be non-empty and must not look like a player id, otherwise
    /// the identifier could not be told apart when read back from storage.
    pub fn virtual_account(name: &str) -> Result<Self, EconomyError> {
        let kind = AccountKind::Virtual(name.trim().to_string());
        kind.validate()?;
        Ok(kind)
    }

    pub fn validate(&self) -> Result<(), EconomyError> {
        match self {
            AccountKind::Player(_) => Ok(()),
            AccountKind::Virtual(name) => {
                if name.trim().is_empty() || Uuid::parse_str(name).is_ok() {
                    Err(EconomyError::InvalidIdentity(name.clone()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Recover the kind from a stored identifier.
    pub fn from_identifier(id: &AccountId) -> Self {
        match Uuid::parse_str(id.as_str()) {
            Ok(uuid) => AccountKind::Player(uuid),
            Err(_) => AccountKind::Virtual(id.as_str().to_string()),
        }
    }

    pub fn id(&self) -> AccountId {
        match self {
            AccountKind::Player(uuid) => AccountId(uuid.hyphenated().to_string()),
            AccountKind::Virtual(name) => AccountId(name.clone()),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, AccountKind::Virtual(_))
    }
}

/// The string identifier accounts are stored under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        AccountId(value)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user row as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: AccountId,
    pub display_name: String,
}

// ============================================================================
// TRANSACTION OUTCOMES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Success,
    InsufficientFunds,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Transfer,
    Reset,
    SetBalance,
}

/// Why a transaction ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The source account has no balance row for the currency.
    AccountNotFound,
    /// The transfer destination has no balance row for the currency.
    DestinationNotInitialized,
    NonTransferableCurrency,
    /// The currency is not in the current registry snapshot.
    UnknownCurrency,
    /// The amount would overflow the stored balance.
    Overflow,
    Storage(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::AccountNotFound => write!(f, "account has no balance record"),
            FailureReason::DestinationNotInitialized => {
                write!(f, "destination has no balance record")
            }
            FailureReason::NonTransferableCurrency => write!(f, "non-transferable currency"),
            FailureReason::UnknownCurrency => write!(f, "unknown currency"),
            FailureReason::Overflow => write!(f, "balance overflow"),
            FailureReason::Storage(msg) => write!(f, "storage failure: {}", msg),
        }
    }
}

/// The value every mutating ledger operation returns.
///
/// Built once per operation and never changed afterwards. Observers receive a
/// reference to the same value the caller gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub account: AccountId,
    /// Only set for transfers.
    pub destination: Option<AccountId>,
    pub currency: CurrencyId,
    pub amount: Amount,
    pub result: ResultKind,
    pub kind: TransactionKind,
    pub failure: Option<FailureReason>,
    pub completed_at: DateTime<Utc>,
}

impl TransactionOutcome {
    pub(crate) fn new(
        kind: TransactionKind,
        account: &AccountId,
        destination: Option<&AccountId>,
        currency: CurrencyId,
        amount: Amount,
    ) -> OutcomeBuilder {
        OutcomeBuilder {
            kind,
            account: account.clone(),
            destination: destination.cloned(),
            currency,
            amount,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == ResultKind::Success
    }
}

/// Collects the fixed parts of an outcome so each exit path only names its result.
pub(crate) struct OutcomeBuilder {
    kind: TransactionKind,
    account: AccountId,
    destination: Option<AccountId>,
    currency: CurrencyId,
    amount: Amount,
}

impl OutcomeBuilder {
    fn finish(&self, result: ResultKind, failure: Option<FailureReason>) -> TransactionOutcome {
        TransactionOutcome {
            account: self.account.clone(),
            destination: self.destination.clone(),
            currency: self.currency,
            amount: self.amount,
            result,
            kind: self.kind,
            failure,
            completed_at: Utc::now(),
        }
    }

    pub(crate) fn success(&self) -> TransactionOutcome {
        self.finish(ResultKind::Success, None)
    }

    pub(crate) fn insufficient_funds(&self) -> TransactionOutcome {
        self.finish(ResultKind::InsufficientFunds, None)
    }

    pub(crate) fn failed(&self, reason: FailureReason) -> TransactionOutcome {
        self.finish(ResultKind::Failed, Some(reason))
    }
}
