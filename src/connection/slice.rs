//! 5G standalone network slice enrichment of an activation.

use crate::apn::item::{ApnItem, ApnType};
use crate::context::Context;
use crate::traits::SliceQuery;
use crate::types::RouteSelectionDescriptor;

/// Look up the route selection parameters for a connection.
///
/// Only consulted with the slice feature on, and only for slice APN types or
/// an APN whose name matches a slice rule. An empty answer is treated as no
/// slice so activation proceeds normally.
pub fn resolve_route_selection(
    ctx: &Context,
    slot_id: i32,
    apn_type: ApnType,
    apn: &ApnItem,
) -> Option<RouteSelectionDescriptor> {
    if !ctx.features.sa_network_slice() {
        return None;
    }
    let query = SliceQuery {
        slice_index: apn_type.slice_index(),
        dnn: &apn.record.apn,
    };
    if query.slice_index.is_none() && query.dnn.is_empty() {
        return None;
    }
    let rsd = ctx.slice.route_selection(slot_id, &query)?;
    if rsd.snssai.is_empty() && rsd.dnn.is_empty() {
        debug!("Empty route selection for {}", apn_type.as_str());
        return None;
    }
    debug!(
        "Slice {} ssc {} dnn {} for {}",
        rsd.snssai,
        rsd.ssc_mode,
        rsd.dnn,
        apn_type.as_str()
    );
    Some(rsd)
}
