use serde_json::Value;

use super::{guarded, AppContext};
use crate::{customers, inventory, table};

// ---------------------------------------------------------------------------
// Generic tables
// ---------------------------------------------------------------------------

pub(super) fn table_fetch(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "table", table::fetch_table)
}

pub(super) fn table_insert(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("manage_catalog"), payload, "table", table::insert_table)
}

pub(super) fn table_update(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("manage_catalog"), payload, "table", table::update_table)
}

pub(super) fn table_delete(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("manage_catalog"), payload, "table", table::delete_table)
}

// ---------------------------------------------------------------------------
// Products and stock
// ---------------------------------------------------------------------------

pub(super) fn products_create(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("manage_catalog"), payload, "sku", inventory::create_product)
}

pub(super) fn stock_adjust(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("adjust_stock"), payload, "productId", inventory::adjust_stock)
}

pub(super) fn stock_transfer(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("adjust_stock"), payload, "productId", inventory::transfer_stock)
}

pub(super) fn stock_get(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "productId", inventory::get_stock)
}

pub(super) fn stock_low(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "lojaId", inventory::list_low_stock)
}

pub(super) fn stock_movements(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "productId", inventory::list_movements)
}

// ---------------------------------------------------------------------------
// Customers
// ---------------------------------------------------------------------------

/// Counter staff register customers while selling.
pub(super) fn customers_create(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("sell"), payload, "name", customers::create_customer)
}

pub(super) fn customers_credit_balance(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "customerId", customers::get_credit_balance)
}

pub(super) fn customers_credit_entries(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "customerId", customers::list_credit_entries)
}
