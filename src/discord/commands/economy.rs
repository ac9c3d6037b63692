// Discord commands for the economy ledger.
//
// Same shape as every other command file:
// 1. Extract primitive data from Discord types
// 2. Call the economy service
// 3. Format the response from the outcome
//
// No balance math happens here.

use economy_ledger::core::economy::{
    AccountKind, Amount, Currency, EconomyError, EconomyService, FailureReason, ResultKind,
    TransactionOutcome,
};
use economy_ledger::infra::economy::SqliteEconomyStore;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use uuid::Uuid;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

/// Shared state handed to every command.
pub struct Data {
    pub economy: Arc<EconomyService<SqliteEconomyStore>>,
}

/// Players are per guild: the same Discord user has a separate account in
/// every server.
pub fn player_identity(guild_id: u64, user_id: u64) -> AccountKind {
    AccountKind::Player(Uuid::from_u64_pair(guild_id, user_id))
}

/// Check your balance
#[poise::command(slash_command, guild_only)]
pub async fn balance(
    ctx: Context<'_>,
    #[description = "Currency name or id (defaults to the main currency)"] currency: Option<
        String,
    >,
) -> Result<(), Error> {
    let author = ctx.author();
    let guild_id = ctx
        .guild_id()
        .ok_or("This command only works in servers")?
        .get();
    let economy = &ctx.data().economy;

    // Unknown names fall back to the default currency.
    let currency = match currency.as_deref().map(|name| economy.resolve_currency(name)) {
        Some(Ok(currency)) => currency,
        _ => economy.default_currency()?,
    };

    let account = economy
        .get_or_create_account(&player_identity(guild_id, author.id.get()), &author.name)
        .await?;

    let amount = match account.get_balance(&currency).await {
        Ok(amount) => amount,
        Err(EconomyError::AccountNotFound { .. }) => {
            ctx.say(format!(
                "You don't have a {} balance yet.",
                currency.name_singular
            ))
            .await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let embed = serenity::CreateEmbed::new()
        .title(format!("💰 {}'s Balance", author.name))
        .color(0xFFD700) // Gold
        .thumbnail(author.face())
        .field(
            currency.display_name_for(amount).to_string(),
            format!("**{}**", format_amount(&currency, amount)),
            true,
        );

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Send money to another member
#[poise::command(slash_command, guild_only)]
pub async fn pay(
    ctx: Context<'_>,
    #[description = "Who to pay"] user: serenity::User,
    #[description = "How much to send, e.g. 12.50"] amount: String,
    #[description = "Currency name or id (defaults to the main currency)"] currency: Option<
        String,
    >,
) -> Result<(), Error> {
    let author = ctx.author();
    if user.id == author.id {
        ctx.say("You can't pay yourself.").await?;
        return Ok(());
    }
    if user.bot {
        ctx.say("Bots don't have wallets! 🤖").await?;
        return Ok(());
    }

    let guild_id = ctx
        .guild_id()
        .ok_or("This command only works in servers")?
        .get();
    let economy = &ctx.data().economy;

    let amount = match Amount::parse(&amount) {
        Ok(amount) if !amount.is_zero() => amount,
        _ => {
            ctx.say(format!("`{}` isn't a valid amount.", amount)).await?;
            return Ok(());
        }
    };

    let currency = match currency {
        Some(name) => match economy.resolve_currency(&name) {
            Ok(currency) => currency,
            Err(_) => {
                ctx.say(format!("There is no currency called `{}`.", name))
                    .await?;
                return Ok(());
            }
        },
        None => economy.default_currency()?,
    };

    let from = economy
        .get_or_create_account(&player_identity(guild_id, author.id.get()), &author.name)
        .await?;
    let to = economy
        .get_or_create_account(&player_identity(guild_id, user.id.get()), &user.name)
        .await?;

    let outcome = economy.transfer(&from, &to, &currency, amount).await;
    let message = payment_message(&outcome, &currency, &user.name);

    if outcome.is_success() {
        let embed = serenity::CreateEmbed::new()
            .title("✅ Payment Sent")
            .description(message)
            .color(0x00FF00); // Green
        ctx.send(poise::CreateReply::default().embed(embed)).await?;
    } else {
        ctx.say(message).await?;
    }

    Ok(())
}

/// List the available currencies
#[poise::command(slash_command, guild_only)]
pub async fn currencies(ctx: Context<'_>) -> Result<(), Error> {
    let lines = ctx
        .data()
        .economy
        .currencies()
        .iter()
        .map(|c| {
            let mut tags = Vec::new();
            if c.is_default {
                tags.push("default");
            }
            if !c.is_transferable {
                tags.push("not transferable");
            }
            let tags = if tags.is_empty() {
                String::new()
            } else {
                format!(" ({})", tags.join(", "))
            };
            format!(
                "`{}` {} / {} {}{}",
                c.id, c.name_singular, c.name_plural, c.symbol, tags
            )
        })
        .collect::<Vec<_>>();

    let description = if lines.is_empty() {
        "No currencies configured".to_string()
    } else {
        lines.join("\n")
    };

    let embed = serenity::CreateEmbed::new()
        .title("🪙 Currencies")
        .description(description)
        .color(0xFFD700);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Reload currency definitions from the database
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn reloadcurrencies(ctx: Context<'_>) -> Result<(), Error> {
    let economy = &ctx.data().economy;

    match economy.reload_currencies().await {
        Ok(()) => {
            ctx.say(format!(
                "✅ Reloaded {} currencies.",
                economy.currencies().len()
            ))
            .await?;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Currency reload rejected");
            ctx.say(format!("❌ Reload failed, keeping the old currencies: {}", e))
                .await?;
        }
    }

    Ok(())
}

/// One message per outcome of `/pay`.
fn payment_message(outcome: &TransactionOutcome, currency: &Currency, recipient: &str) -> String {
    match (&outcome.result, &outcome.failure) {
        (ResultKind::Success, _) => format!(
            "You sent **{}** to {}.",
            format_amount(currency, outcome.amount),
            recipient
        ),
        (ResultKind::InsufficientFunds, _) => format!(
            "You don't have enough {} for that.",
            currency.name_plural
        ),
        (_, Some(FailureReason::NonTransferableCurrency)) => {
            format!("{} can't be transferred.", currency.name_plural)
        }
        (_, Some(FailureReason::UnknownCurrency)) => {
            "That currency no longer exists.".to_string()
        }
        (_, failure) => {
            tracing::warn!(
                account = %outcome.account,
                failure = ?failure,
                "Payment failed"
            );
            "Something went wrong, no money was moved. Try again later.".to_string()
        }
    }
}

/// Render an amount with the currency symbol and thousands separators,
/// e.g. `$1,234.50`.
fn format_amount(currency: &Currency, amount: Amount) -> String {
    let text = amount.to_string();
    let (whole, fraction) = text.split_once('.').unwrap_or((text.as_str(), "00"));
    format!("{}{}.{}", currency.symbol, format_number(whole), fraction)
}

/// Format a string of digits with commas for readability
fn format_number(digits: &str) -> String {
    let mut result = String::new();
    for (i, c) in digits.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.insert(0, ',');
        }
        result.insert(0, c);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use economy_ledger::core::economy::{AccountId, CurrencyId, TransactionKind};

    fn dollar() -> Currency {
        Currency {
            id: CurrencyId(1),
            name_singular: "Dollar".to_string(),
            name_plural: "Dollars".to_string(),
            symbol: "$".to_string(),
            is_default: true,
            is_transferable: true,
            starting_balance: Amount::ZERO,
        }
    }

    fn outcome(result: ResultKind, failure: Option<FailureReason>) -> TransactionOutcome {
        TransactionOutcome {
            account: AccountId::from("a".to_string()),
            destination: Some(AccountId::from("b".to_string())),
            currency: CurrencyId(1),
            amount: Amount::parse("1234.5").unwrap(),
            result,
            kind: TransactionKind::Transfer,
            failure,
            completed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number("0"), "0");
        assert_eq!(format_number("100"), "100");
        assert_eq!(format_number("1000"), "1,000");
        assert_eq!(format_number("1234567"), "1,234,567");
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(
            format_amount(&dollar(), Amount::parse("1234567.5").unwrap()),
            "$1,234,567.50"
        );
        assert_eq!(format_amount(&dollar(), Amount::ZERO), "$0.00");
    }

    #[test]
    fn test_player_identity_is_per_guild() {
        assert_eq!(player_identity(1, 2), player_identity(1, 2));
        assert_ne!(player_identity(1, 2), player_identity(3, 2));
    }

    #[test]
    fn test_payment_messages() {
        let usd = dollar();
        assert_eq!(
            payment_message(&outcome(ResultKind::Success, None), &usd, "Bob"),
            "You sent **$1,234.50** to Bob."
        );
        assert!(
            payment_message(&outcome(ResultKind::InsufficientFunds, None), &usd, "Bob")
                .contains("enough Dollars")
        );
        assert_eq!(
            payment_message(
                &outcome(
                    ResultKind::Failed,
                    Some(FailureReason::NonTransferableCurrency)
                ),
                &usd,
                "Bob"
            ),
            "Dollars can't be transferred."
        );
        assert!(payment_message(
            &outcome(
                ResultKind::Failed,
                Some(FailureReason::Storage("disk".to_string()))
            ),
            &usd,
            "Bob"
        )
        .starts_with("Something went wrong"));
    }
}
