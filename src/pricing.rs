//! Cost estimation. Pure and idempotent: safe to recompute at any point
//! before completion, never incrementally maintained.

use crate::model::{CostEstimate, ProviderProfile, ServiceItem, SlotType};

/// Multiply by basis points, rounding half-up.
fn apply_bps(cents: i64, bps: i64) -> i64 {
    (cents * bps + 5_000) / 10_000
}

/// Estimate over the planned service items, the slot type's price
/// multiplier, the provider's delivery-fee rule, and a fixed tax rate.
pub fn estimate_cost(
    services: &[ServiceItem],
    slot_type: SlotType,
    provider: &ProviderProfile,
    tax_rate_bps: i64,
) -> CostEstimate {
    let base: i64 = services
        .iter()
        .map(|s| s.unit_price_cents * i64::from(s.quantity))
        .sum();
    let subtotal_cents = apply_bps(base, slot_type.price_multiplier_bps());

    let delivery_fee_cents = match provider.free_delivery_over_cents {
        Some(threshold) if subtotal_cents >= threshold => 0,
        _ => provider.delivery_fee_cents,
    };

    let tax_cents = apply_bps(subtotal_cents + delivery_fee_cents, tax_rate_bps);

    CostEstimate {
        subtotal_cents,
        delivery_fee_cents,
        tax_cents,
        total_cents: subtotal_cents + delivery_fee_cents + tax_cents,
    }
}
