//! The `State` module drives ledger commands received over a channel.
use tokio::sync::mpsc;
use tracing::warn;

use crate::bank::{
    AccountType, Command, CommandType, LedgerService, Outcome, Status, format_money,
};

/// Runs commands against the ledger and collects their outcomes in arrival order.
pub struct State {
    ledger: LedgerService,
    /// A channel receiver for incoming commands.
    receiver: mpsc::Receiver<Command>,
    outcomes: Vec<Outcome>,
}

impl State {
    pub fn new(ledger: LedgerService, receiver: mpsc::Receiver<Command>) -> Self {
        State {
            ledger,
            receiver,
            outcomes: Vec::new(),
        }
    }

    /// Outcomes of every processed command.
    pub fn get_outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Processes a command, turning every ledger error into a failed outcome.
    async fn process_command(&self, command: &Command) -> Outcome {
        let username = command.get_username();
        match command.get_type() {
            CommandType::Accounts => match self.ledger.get_user_accounts(username).await {
                Ok(accounts) => {
                    let listing = accounts
                        .iter()
                        .map(|a| format!("{} {} {}", a.account_type, a.id, format_money(a.balance)))
                        .collect::<Vec<_>>()
                        .join("; ");
                    Outcome::success(command, None, None, listing)
                }
                Err(err) => Outcome::from_error(command, err),
            },
            CommandType::Balance => {
                let Some(account_id) = command.get_account() else {
                    return Outcome::failure(command, "Please select an account".to_string());
                };
                match self.ledger.account_balance(username, account_id).await {
                    Ok(account) => Outcome::success(
                        command,
                        Some(account.id),
                        Some(account.balance),
                        format!("{} balance", account.account_type),
                    ),
                    Err(err) => Outcome::from_error(command, err),
                }
            }
            CommandType::Deposit | CommandType::Withdraw => {
                let Some(account_id) = command.get_account() else {
                    return Outcome::failure(command, "Please select an account".to_string());
                };
                let amount = command.get_amount();
                let result = if command.get_type() == CommandType::Deposit {
                    self.ledger.deposit(account_id, amount).await
                } else {
                    self.ledger.withdraw(account_id, amount).await
                };
                match result {
                    Ok(balance) => {
                        let verb = if command.get_type() == CommandType::Deposit {
                            "deposited"
                        } else {
                            "withdrew"
                        };
                        Outcome::success(
                            command,
                            Some(account_id.to_string()),
                            Some(balance),
                            format!(
                                "Successfully {verb} ${amount:.2}. New balance: ${}",
                                format_money(balance)
                            ),
                        )
                    }
                    Err(err) => Outcome::from_error(command, err),
                }
            }
            CommandType::Open => {
                let kind = command.get_kind();
                match self
                    .ledger
                    .open_account(username, kind, command.get_initial_deposit())
                    .await
                {
                    Ok(opened) => Outcome::success(
                        command,
                        Some(opened.account_id.clone()),
                        Some(opened.balance),
                        format!(
                            "Successfully opened {kind} account #{} with balance ${}",
                            opened.account_id,
                            format_money(opened.balance)
                        ),
                    ),
                    Err(err) => Outcome::from_error(command, err),
                }
            }
            CommandType::Options => match self.ledger.account_options(username).await {
                Ok(options) => {
                    let open = [AccountType::Chequing, AccountType::Savings]
                        .into_iter()
                        .filter(|t| options.can_open(*t))
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>();
                    let message = if open.is_empty() {
                        "You already have both account types".to_string()
                    } else {
                        format!("You can open: {}", open.join(", "))
                    };
                    Outcome::success(command, None, None, message)
                }
                Err(err) => Outcome::from_error(command, err),
            },
        }
    }

    /// Runs the command loop until the sender side is closed.
    pub async fn run(&mut self) {
        while let Some(command) = self.receiver.recv().await {
            let outcome = self.process_command(&command).await;
            if outcome.status == Status::Error {
                warn!(
                    "{:?} for {} failed: {}",
                    command.get_type(),
                    command.get_username(),
                    outcome.message
                );
            }
            self.outcomes.push(outcome);
        }
    }
}
