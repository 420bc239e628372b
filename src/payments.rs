//! Payment settlement shared by sales and service-order delivery.
//!
//! A checkout carries a list of `{method, amount}` lines. Settlement checks
//! that they cover the total, derives the change (cash only), and then
//! records one payment row per method with the net amount kept. Cash goes to
//! the loja's open caixa; store credit is redeemed from the customer ledger.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::cash_register::{open_session_id, record_movement, require_open_session};
use crate::customers::redeem_credit;
use crate::data_helpers::query_all_json;
use crate::money::{from_cents, to_cents, OUT_OF_RANGE};
use crate::now_iso;
use crate::sync::enqueue_row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PaymentMethod {
    Cash,
    Card,
    Pix,
    Credit,
}

impl PaymentMethod {
    pub(crate) fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cash" | "dinheiro" => Ok(Self::Cash),
            "card" | "cartao" => Ok(Self::Card),
            "pix" => Ok(Self::Pix),
            "credit" | "credito" => Ok(Self::Credit),
            other => Err(format!(
                "Invalid payment method: {other}. Must be cash, card, pix or credit"
            )),
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Card => "card",
            Self::Pix => "pix",
            Self::Credit => "credit",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PaymentLine {
    pub method: PaymentMethod,
    pub amount_cents: i64,
}

/// Outcome of matching payment lines against a total.
#[derive(Debug, Clone, Default)]
pub(crate) struct Settlement {
    pub total_cents: i64,
    pub paid_cents: i64,
    pub change_cents: i64,
    /// Cash kept after change.
    pub net_cash_cents: i64,
    pub card_cents: i64,
    pub pix_cents: i64,
    pub credit_cents: i64,
}

impl Settlement {
    fn kept(&self) -> [(PaymentMethod, i64); 4] {
        [
            (PaymentMethod::Cash, self.net_cash_cents),
            (PaymentMethod::Card, self.card_cents),
            (PaymentMethod::Pix, self.pix_cents),
            (PaymentMethod::Credit, self.credit_cents),
        ]
    }
}

/// Read the `payments` array of a checkout payload.
pub(crate) fn parse_payments(payload: &Value) -> Result<Vec<PaymentLine>, String> {
    let Some(raw) = payload.get("payments") else {
        return Ok(Vec::new());
    };
    let arr = raw.as_array().ok_or("payments must be an array")?;
    let mut lines = Vec::with_capacity(arr.len());
    for (idx, entry) in arr.iter().enumerate() {
        let method = entry
            .get("method")
            .and_then(|m| m.as_str())
            .ok_or_else(|| format!("payments[{idx}]: missing method"))?;
        let amount = entry
            .get("amount")
            .and_then(|a| a.as_f64())
            .ok_or_else(|| format!("payments[{idx}]: missing amount"))?;
        let amount_cents = to_cents(amount);
        if amount_cents <= 0 {
            return Err(format!("payments[{idx}]: amount must be positive"));
        }
        lines.push(PaymentLine {
            method: PaymentMethod::parse(method)?,
            amount_cents,
        });
    }
    Ok(lines)
}

/// Check coverage and compute change. Change may only come from cash.
pub(crate) fn settle(total_cents: i64, lines: &[PaymentLine]) -> Result<Settlement, String> {
    let mut s = Settlement {
        total_cents,
        ..Settlement::default()
    };
    let mut cash = 0i64;
    for line in lines {
        let slot = match line.method {
            PaymentMethod::Cash => &mut cash,
            PaymentMethod::Card => &mut s.card_cents,
            PaymentMethod::Pix => &mut s.pix_cents,
            PaymentMethod::Credit => &mut s.credit_cents,
        };
        *slot = slot.checked_add(line.amount_cents).ok_or(OUT_OF_RANGE)?;
        s.paid_cents = s.paid_cents.checked_add(line.amount_cents).ok_or(OUT_OF_RANGE)?;
    }

    if s.paid_cents < total_cents {
        return Err(format!(
            "Insufficient payment: total {:.2}, paid {:.2}",
            from_cents(total_cents),
            from_cents(s.paid_cents)
        ));
    }
    s.change_cents = s.paid_cents - total_cents;
    if s.change_cents > cash {
        return Err("Change can only be given from cash".into());
    }
    s.net_cash_cents = cash - s.change_cents;
    Ok(s)
}

/// Caixa the checkout is attached to. Cash requires one; otherwise the open
/// session (if any) is still linked for reporting.
pub(crate) fn resolve_session(
    conn: &Connection,
    loja_id: &str,
    settlement: &Settlement,
) -> Result<Option<String>, String> {
    if settlement.net_cash_cents > 0 {
        require_open_session(conn, loja_id).map(Some)
    } else {
        open_session_id(conn, loja_id)
    }
}

/// Where the money belongs.
pub(crate) struct PaymentTarget<'a> {
    /// `sale` or `service_order`.
    pub reference_type: &'a str,
    pub reference_id: &'a str,
    pub customer_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub staff_id: Option<&'a str>,
}

/// Persist a settlement inside the caller's transaction.
pub(crate) fn record_payments(
    conn: &Connection,
    target: &PaymentTarget,
    settlement: &Settlement,
) -> Result<(), String> {
    if settlement.credit_cents > 0 {
        let customer_id = target
            .customer_id
            .ok_or("Store credit payment requires a customer")?;
        redeem_credit(
            conn,
            customer_id,
            settlement.credit_cents,
            target.reference_type,
            target.reference_id,
        )?;
    }

    let now = now_iso();
    for (method, cents) in settlement.kept() {
        if cents <= 0 {
            continue;
        }
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO payments (id, reference_type, reference_id, method, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                target.reference_type,
                target.reference_id,
                method.as_str(),
                from_cents(cents),
                now
            ],
        )
        .map_err(|e| format!("insert payment: {e}"))?;
        enqueue_row(conn, "payments", &id, "insert")?;
    }

    if settlement.net_cash_cents > 0 {
        let session_id = target
            .session_id
            .ok_or("Cash payment requires an open caixa")?;
        record_movement(
            conn,
            session_id,
            target.reference_type,
            settlement.net_cash_cents,
            Some(target.reference_type),
            Some(target.reference_id),
            None,
            target.staff_id,
        )?;
    }

    info!(
        reference_type = target.reference_type,
        reference_id = %target.reference_id,
        total = from_cents(settlement.total_cents),
        change = from_cents(settlement.change_cents),
        "payments recorded"
    );
    Ok(())
}

pub(crate) fn list_payments(
    conn: &Connection,
    reference_type: &str,
    reference_id: &str,
) -> Result<Vec<Value>, String> {
    query_all_json(
        conn,
        "SELECT id, method, amount, created_at FROM payments
         WHERE reference_type = ?1 AND reference_id = ?2
         ORDER BY created_at, rowid",
        params![reference_type, reference_id],
    )
}

/// Kept amount per method for one reference, in cents.
pub(crate) fn paid_by_method(
    conn: &Connection,
    reference_type: &str,
    reference_id: &str,
) -> Result<Vec<(PaymentMethod, i64)>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT method, COALESCE(SUM(amount), 0) FROM payments
             WHERE reference_type = ?1 AND reference_id = ?2 GROUP BY method",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map(params![reference_type, reference_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })
        .map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    for (method, sum) in rows.flatten() {
        out.push((PaymentMethod::parse(&method)?, to_cents(sum)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lines(v: Value) -> Vec<PaymentLine> {
        parse_payments(&json!({ "payments": v })).unwrap()
    }

    #[test]
    fn cash_overpayment_gives_change() {
        let s = settle(8_990, &lines(json!([{ "method": "cash", "amount": 100 }]))).unwrap();
        assert_eq!(s.change_cents, 1_010);
        assert_eq!(s.net_cash_cents, 8_990);
    }

    #[test]
    fn split_payment_takes_change_from_cash_only() {
        let s = settle(
            10_000,
            &lines(json!([
                { "method": "card", "amount": 60 },
                { "method": "cash", "amount": 50 }
            ])),
        )
        .unwrap();
        assert_eq!(s.change_cents, 1_000);
        assert_eq!(s.net_cash_cents, 4_000);
        assert_eq!(s.card_cents, 6_000);

        let err = settle(
            10_000,
            &lines(json!([
                { "method": "pix", "amount": 105 },
                { "method": "cash", "amount": 2 }
            ])),
        )
        .unwrap_err();
        assert_eq!(err, "Change can only be given from cash");
    }

    #[test]
    fn underpayment_is_rejected() {
        let err = settle(5_000, &lines(json!([{ "method": "card", "amount": 49.99 }]))).unwrap_err();
        assert_eq!(err, "Insufficient payment: total 50.00, paid 49.99");
    }

    #[test]
    fn payment_sums_that_overflow_are_rejected() {
        let huge = lines(json!([
            { "method": "card", "amount": 9e16 },
            { "method": "card", "amount": 9e16 }
        ]));
        assert_eq!(settle(100, &huge).unwrap_err(), "amount out of range");
    }

    #[test]
    fn parse_rejects_bad_lines() {
        assert!(parse_payments(&json!({ "payments": [{ "method": "cheque", "amount": 1 }] })).is_err());
        assert!(parse_payments(&json!({ "payments": [{ "method": "cash", "amount": 0 }] })).is_err());
        assert!(parse_payments(&json!({})).unwrap().is_empty());
        assert_eq!(PaymentMethod::parse("Dinheiro").unwrap(), PaymentMethod::Cash);
    }
}
