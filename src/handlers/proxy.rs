//! Forwarding operations to another controller.
//!
//! A proxied operation runs in two phases. The remote side executes up to
//! the point where it would commit and reports its prepared result. The
//! local operation then commits or rolls back, and the remote transaction
//! follows that decision through its [`ProxyTransaction`].

use crate::access::CallerContext;
use crate::context::{OperationContext, OperationStepHandler};
use crate::controller::{ModelController, PreparedVote, TransactionControl};
use crate::error::{ErrorCategory, Result};
use crate::operation::{Operation, OperationResponse};
use log::{debug, warn};
use pathaddr::PathAddress;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use txkit::ControllerResource;

/// A controller reachable at an address of the local model.
pub trait ProxyController: Send + Sync {
    /// Address at which the proxied model is mounted.
    fn proxy_address(&self) -> &PathAddress;

    /// Execute `operation`, addressed relative to the proxied model.
    fn execute(&self, operation: Operation, caller: &CallerContext) -> ProxyResult;
}

/// What the remote side reports after executing an operation.
pub enum ProxyResult {
    /// Ready to commit; awaiting the decision.
    Prepared {
        response: OperationResponse,
        transaction: Box<dyn ProxyTransaction>,
    },
    /// Rejected before reaching the prepared phase.
    Failed(OperationResponse),
    /// Finished without needing a commit decision.
    Completed(OperationResponse),
}

/// The remote half of a prepared operation.
pub trait ProxyTransaction: Send {
    /// Commit and return the final response.
    fn commit(self: Box<Self>) -> OperationResponse;

    /// Roll back and return the final response.
    fn rollback(self: Box<Self>) -> OperationResponse;
}

/// Ties a prepared remote transaction to the local one.
struct ProxyCommit {
    transaction: Option<Box<dyn ProxyTransaction>>,
    outcome: Arc<Mutex<Option<OperationResponse>>>,
}

impl ProxyCommit {
    fn finish(&mut self, commit: bool) {
        let Some(transaction) = self.transaction.take() else {
            return;
        };
        let response = if commit {
            transaction.commit()
        } else {
            transaction.rollback()
        };
        let mut slot = match self.outcome.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(response);
    }
}

impl ControllerResource for ProxyCommit {
    fn commit(&mut self) -> anyhow::Result<()> {
        self.finish(true);
        Ok(())
    }

    fn rollback(&mut self) -> anyhow::Result<()> {
        self.finish(false);
        Ok(())
    }
}

impl Drop for ProxyCommit {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            warn!("Proxied transaction abandoned; rolling it back");
            self.finish(false);
        }
    }
}

/// Step handler registered at a proxy's address.
pub struct ProxyStepHandler {
    proxy: Arc<dyn ProxyController>,
}

impl ProxyStepHandler {
    pub fn new(proxy: Arc<dyn ProxyController>) -> Self {
        Self { proxy }
    }
}

impl OperationStepHandler for ProxyStepHandler {
    fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<()> {
        let prefix = self.proxy.proxy_address();
        let remote = operation.with_address(operation.address.sub_address(prefix.len()));
        debug!("Forwarding '{}' to proxy at {prefix} as {}", operation.name, remote.address);

        let (response, transaction) = match self.proxy.execute(remote, ctx.caller()) {
            ProxyResult::Failed(response) | ProxyResult::Completed(response) => {
                apply_response(ctx, prefix, &response);
                ctx.step_completed();
                return Ok(());
            }
            ProxyResult::Prepared { response, transaction } => (response, transaction),
        };

        let outcome = Arc::new(Mutex::new(None));
        ctx.register_transaction_resource(Box::new(ProxyCommit {
            transaction: Some(transaction),
            outcome: Arc::clone(&outcome),
        }))?;
        apply_response(ctx, prefix, &response);
        if ctx.complete_step().is_rollback() {
            return Ok(());
        }

        let finished = match outcome.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(finished) = finished {
            apply_response(ctx, prefix, &finished);
        }
        Ok(())
    }
}

/// Copy a remote response into the current step's response.
fn apply_response(ctx: &mut OperationContext, prefix: &PathAddress, response: &OperationResponse) {
    if !response.result.is_null() {
        ctx.set_result(response.result.clone());
    }
    for (name, value) in &response.response_headers {
        ctx.set_response_header(name.clone(), value.clone());
    }
    if let Some(undo) = &response.compensating_operation {
        ctx.set_compensating_operation(undo.with_address(prefix.append(&undo.address)));
    }
    if let Some(description) = &response.failure_description
        && !ctx.has_failure()
    {
        ctx.set_failure(description.clone());
    }
}

// ============================================================================
// In-process proxy
// ============================================================================

/// Proxies to another [`ModelController`] in the same process.
///
/// The target runs each operation on its own thread, pausing at commit
/// until the local transaction decides.
pub struct LocalProxyController {
    address: PathAddress,
    target: ModelController,
}

impl LocalProxyController {
    pub fn new(address: PathAddress, target: ModelController) -> Self {
        Self { address, target }
    }
}

/// Transaction control that hands the prepared response to the proxy
/// and waits for the local decision.
struct ChannelControl {
    prepared: SyncSender<OperationResponse>,
    decision: Mutex<Receiver<bool>>,
}

impl TransactionControl for ChannelControl {
    fn operation_prepared(&self, vote: &mut PreparedVote, response: &OperationResponse) {
        if self.prepared.send(response.clone()).is_err() {
            return;
        }
        let decision = match self.decision.lock() {
            Ok(receiver) => receiver.recv(),
            Err(poisoned) => poisoned.into_inner().recv(),
        };
        if matches!(decision, Ok(true)) {
            vote.commit();
        }
    }
}

struct LocalProxyTransaction {
    decision: SyncSender<bool>,
    done: Receiver<OperationResponse>,
}

impl LocalProxyTransaction {
    fn decide(self, commit: bool) -> OperationResponse {
        if self.decision.send(commit).is_err() {
            debug!("Proxied operation ended before the decision arrived");
        }
        self.done.recv().unwrap_or_else(|_| lost_response())
    }
}

impl ProxyTransaction for LocalProxyTransaction {
    fn commit(self: Box<Self>) -> OperationResponse {
        self.decide(true)
    }

    fn rollback(self: Box<Self>) -> OperationResponse {
        self.decide(false)
    }
}

impl ProxyController for LocalProxyController {
    fn proxy_address(&self) -> &PathAddress {
        &self.address
    }

    fn execute(&self, operation: Operation, caller: &CallerContext) -> ProxyResult {
        let (prepared_tx, prepared_rx) = mpsc::sync_channel(1);
        let (decision_tx, decision_rx) = mpsc::sync_channel(1);
        let (done_tx, done_rx) = mpsc::sync_channel(1);

        let control = Arc::new(ChannelControl {
            prepared: prepared_tx,
            decision: Mutex::new(decision_rx),
        });
        let target = self.target.clone();
        let caller = caller.clone();
        let spawned = thread::Builder::new()
            .name(format!("modelctl-proxy-{}", operation.name))
            .spawn(move || {
                let response = target.execute_with(operation, caller, Some(control));
                if done_tx.send(response).is_err() {
                    debug!("Proxy caller went away before the response");
                }
            });
        if let Err(err) = spawned {
            warn!("Failed to start proxied operation: {err}");
        }

        match prepared_rx.recv() {
            Ok(response) => ProxyResult::Prepared {
                response,
                transaction: Box::new(LocalProxyTransaction {
                    decision: decision_tx,
                    done: done_rx,
                }),
            },
            Err(_) => {
                let response = done_rx.recv().unwrap_or_else(|_| lost_response());
                if response.is_success() {
                    ProxyResult::Completed(response)
                } else {
                    ProxyResult::Failed(response)
                }
            }
        }
    }
}

fn lost_response() -> OperationResponse {
    OperationResponse::failed("Proxied controller did not respond", ErrorCategory::Server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::names;
    use crate::testing::{addr, subsystem_controller};
    use serde_json::json;

    fn proxied() -> (ModelController, ModelController) {
        let local = subsystem_controller();
        let remote = subsystem_controller();
        local
            .register_proxy(Arc::new(LocalProxyController::new(addr("/host=remote"), remote.clone())))
            .unwrap();
        (local, remote)
    }

    #[test]
    fn test_proxied_add_commits_remotely() {
        let (local, remote) = proxied();
        let response = local.execute(Operation::new(names::ADD, addr("/host=remote/subsystem=foo")).param("value", 4));
        assert!(response.is_success(), "{response:?}");
        assert!(remote.root().contains(&addr("/subsystem=foo")));
        assert!(!local.root().contains(&addr("/host=remote")));
        assert_eq!(
            response.compensating_operation.unwrap().address,
            addr("/host=remote/subsystem=foo")
        );

        let read = local.execute(
            Operation::new(names::READ_ATTRIBUTE, addr("/host=remote/subsystem=foo")).param(names::NAME, "value"),
        );
        assert_eq!(read.result, json!(4));
    }

    #[test]
    fn test_remote_failure_is_reported() {
        let (local, remote) = proxied();
        let response = local.execute(Operation::new(names::ADD, addr("/host=remote/subsystem=foo")));
        assert!(!response.is_success());
        assert!(response.failure_description.unwrap().contains("value"));
        assert!(!remote.root().contains(&addr("/subsystem=foo")));
    }

    #[test]
    fn test_rejected_remote_operation_is_failed() {
        let remote = subsystem_controller();
        let proxy = LocalProxyController::new(addr("/host=remote"), remote);
        let result = proxy.execute(Operation::new(names::ADD, addr("/subsystem=foo")), &CallerContext::default());
        let ProxyResult::Failed(response) = result else {
            panic!("expected the remote add to fail before preparing");
        };
        assert!(response.failure_description.unwrap().contains("value"));
    }

    #[test]
    fn test_local_rollback_rolls_back_remote() {
        let (local, remote) = proxied();
        let response = local.execute(
            Operation::new(names::COMPOSITE, PathAddress::EMPTY).param(
                names::STEPS,
                json!([
                    {"operation": "add", "address": [{"host": "remote"}, {"subsystem": "foo"}], "value": 1},
                    {"operation": "add", "address": [{"subsystem": "bar"}]},
                ]),
            ),
        );
        assert!(response.rolled_back, "{response:?}");
        assert!(!remote.root().contains(&addr("/subsystem=foo")));
        assert!(!local.root().contains(&addr("/subsystem=bar")));
    }
}
