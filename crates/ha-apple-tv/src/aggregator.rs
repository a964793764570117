//! Discovery aggregation
//!
//! A device announces each of its protocols separately, so one physical box
//! produces a burst of zeroconf flows. The first flow for an address waits
//! for the burst to settle and then claims the address; every later flow
//! hands its identifier to the claimant and aborts.
//!
//! The claim is published only after the wait. Checking for an existing
//! claim and publishing our own happen in one registry transaction, so two
//! flows waking at the same instant cannot both win.

use std::collections::HashMap;
use std::time::Duration;

use ha_config_entries::{AbortFlow, ConfigEntrySource, FlowHandle, FlowProgress};
use tracing::debug;

use crate::errors::FlowErrorReason;

/// Merge `identifier` into a sibling zeroconf flow that has claimed
/// `address`. Returns false when there is no such flow.
fn merge_into_sibling(
    flows: &mut HashMap<String, FlowProgress>,
    own_flow_id: &str,
    handler: &str,
    address: &str,
    identifier: &str,
) -> bool {
    let sibling = flows.values_mut().find(|p| {
        p.flow_id != own_flow_id
            && p.handler == handler
            && p.context.source == ConfigEntrySource::Zeroconf
            && p.context.address.as_deref() == Some(address)
    });

    match sibling {
        Some(progress) => {
            if progress.context.all_identifiers.insert(identifier.to_string()) {
                debug!(
                    flow_id = %progress.flow_id,
                    identifier,
                    "Merged identifier into flow in progress"
                );
            }
            true
        }
        None => false,
    }
}

/// Coalesce this discovery into the flow that owns `address`, or become that
/// flow after `window` has passed.
///
/// Aborts with `already_in_progress` when another flow owns the address, and
/// with `unknown` when this flow was removed from the registry during the
/// wait.
pub async fn aggregate(
    flow: &FlowHandle,
    address: &str,
    identifier: &str,
    window: Duration,
) -> Result<(), AbortFlow> {
    let merged = flow.registry().transaction(|flows| {
        merge_into_sibling(flows, flow.flow_id(), flow.handler(), address, identifier)
    });
    if merged {
        return Err(FlowErrorReason::AlreadyInProgress.into());
    }

    debug!(address, identifier, ?window, "Waiting for sibling discoveries");
    tokio::time::sleep(window).await;

    flow.registry()
        .transaction(|flows| -> Result<(), AbortFlow> {
            if !flows.contains_key(flow.flow_id()) {
                debug!(flow_id = flow.flow_id(), "Flow was removed while waiting");
                return Err(FlowErrorReason::Unknown.into());
            }
            if merge_into_sibling(flows, flow.flow_id(), flow.handler(), address, identifier) {
                return Err(FlowErrorReason::AlreadyInProgress.into());
            }
            if let Some(own) = flows.get_mut(flow.flow_id()) {
                own.context.address = Some(address.to_string());
            }
            Ok(())
        })?;

    debug!(flow_id = flow.flow_id(), address, "Claimed address");
    Ok(())
}
