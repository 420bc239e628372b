//! Printable caixa closing report and the sales summary.

use std::fs;
use std::path::Path;

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use tracing::info;

use crate::cash_register::session_summary;
use crate::data_helpers::query_all_json;
use crate::db::{self, DbState};
use crate::money::{from_cents, to_cents};
use crate::{value_i64, value_str};

const REPORTS_DIR: &str = "reports";
const SETTINGS_CATEGORY: &str = "report";

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn money_cell(v: &Value) -> String {
    v.as_f64()
        .map(|n| format!("{n:.2}"))
        .unwrap_or_else(|| "-".to_string())
}

fn text<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Caixa closing report
// ---------------------------------------------------------------------------

/// Render the closing report for a caixa session and write it under
/// `{data_dir}/reports/`. Returns the file path.
pub fn generate_cash_closing_report(db: &DbState, payload: &Value, data_dir: &Path) -> Result<Value, String> {
    let session_id =
        value_str(payload, &["sessionId", "session_id"]).ok_or("Missing required field: sessionId")?;

    let (summary, business_name, business_document, loja_name) = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let summary = session_summary(&conn, &session_id)?;
        let loja_id = text(&summary["session"], "loja_id").to_string();
        let loja_name: String = conn
            .query_row("SELECT name FROM lojas WHERE id = ?1", params![loja_id], |row| row.get(0))
            .unwrap_or(loja_id);
        (
            summary,
            db::get_setting(&conn, SETTINGS_CATEGORY, "business_name").unwrap_or_default(),
            db::get_setting(&conn, SETTINGS_CATEGORY, "business_document").unwrap_or_default(),
            loja_name,
        )
    };

    let session = &summary["session"];
    let status = text(session, "status");

    let mut type_rows = String::new();
    if let Some(map) = summary["totalsByType"].as_object() {
        for (movement_type, amount) in map {
            type_rows.push_str(&format!(
                "<tr><td>{}</td><td class=\"num\">{}</td></tr>\n",
                escape_html(movement_type),
                money_cell(amount)
            ));
        }
    }
    let mut method_rows = String::new();
    if let Some(map) = summary["salesByMethod"].as_object() {
        for (method, amount) in map {
            method_rows.push_str(&format!(
                "<tr><td>{}</td><td class=\"num\">{}</td></tr>\n",
                escape_html(method),
                money_cell(amount)
            ));
        }
    }

    let html = format!(
        r#"<!DOCTYPE html>
<html lang="pt-BR">
<head>
<meta charset="UTF-8"/>
<title>Fechamento de caixa - {session_id}</title>
<style>
  body {{ margin: 0; padding: 16px; font-family: monospace; }}
  h1 {{ margin: 0 0 4px 0; font-size: 18px; }}
  table {{ width: 100%; border-collapse: collapse; margin: 8px 0; }}
  td {{ padding: 2px 0; }}
  .num {{ text-align: right; }}
  hr {{ border: none; border-top: 1px dashed #000; margin: 8px 0; }}
</style>
</head>
<body>
<h1>{business_name}</h1>
<div>{business_document}</div>
<hr/>
<h2>FECHAMENTO DE CAIXA</h2>
<table>
<tr><td>Loja</td><td class="num">{loja_name}</td></tr>
<tr><td>Sessao</td><td class="num">{session_short}</td></tr>
<tr><td>Status</td><td class="num">{status}</td></tr>
<tr><td>Abertura</td><td class="num">{opened_at}</td></tr>
<tr><td>Fechamento</td><td class="num">{closed_at}</td></tr>
<tr><td>Vendas</td><td class="num">{sales_count}</td></tr>
</table>
<hr/>
<h3>Movimentos</h3>
<table>
{type_rows}</table>
<h3>Recebimentos por forma</h3>
<table>
{method_rows}</table>
<hr/>
<table>
<tr><td>Fundo de troco</td><td class="num">{opening}</td></tr>
<tr><td>Esperado</td><td class="num">{expected}</td></tr>
<tr><td>Contado</td><td class="num">{counted}</td></tr>
<tr><td>Diferenca</td><td class="num">{variance}</td></tr>
</table>
<div>{note}</div>
</body>
</html>"#,
        session_id = escape_html(&session_id),
        session_short = escape_html(session_id.get(..8).unwrap_or(&session_id)),
        business_name = escape_html(&business_name),
        business_document = escape_html(&business_document),
        loja_name = escape_html(&loja_name),
        status = escape_html(status),
        opened_at = escape_html(text(session, "opened_at")),
        closed_at = escape_html(text(session, "closed_at")),
        sales_count = summary["salesCount"].as_i64().unwrap_or(0),
        opening = money_cell(&session["opening_amount"]),
        expected = money_cell(&summary["expectedAmount"]),
        counted = money_cell(&session["counted_amount"]),
        variance = money_cell(&session["variance"]),
        note = escape_html(text(session, "note")),
    );

    let reports_dir = data_dir.join(REPORTS_DIR);
    fs::create_dir_all(&reports_dir).map_err(|e| format!("create reports dir: {e}"))?;
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let file_path = reports_dir.join(format!("fechamento_{session_id}_{timestamp}.html"));
    fs::write(&file_path, html).map_err(|e| format!("write closing report: {e}"))?;
    let path = file_path.to_string_lossy().to_string();

    info!(session_id = %session_id, path = %path, "cash closing report generated");
    Ok(serde_json::json!({ "success": true, "path": path, "status": status }))
}

// ---------------------------------------------------------------------------
// Sales summary
// ---------------------------------------------------------------------------

pub fn sales_summary(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]);
    let from = value_str(payload, &["from", "dateFrom"]);
    let to = value_str(payload, &["to", "dateTo"]);
    let top = value_i64(payload, &["top", "topProducts"]).unwrap_or(5).clamp(1, 50);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    const SALE_FILTER: &str = "(?1 IS NULL OR s.loja_id = ?1)
           AND (?2 IS NULL OR s.created_at >= ?2)
           AND (?3 IS NULL OR s.created_at <= ?3)";

    let (count, gross, discounts, net): (i64, f64, f64, f64) = conn
        .query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(subtotal), 0), COALESCE(SUM(discount_amount), 0),
                        COALESCE(SUM(total), 0)
                 FROM sales s WHERE s.status != 'cancelada' AND {SALE_FILTER}"
            ),
            params![loja_id, from, to],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(|e| format!("sales totals: {e}"))?;

    let cancelled: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM sales s WHERE s.status = 'cancelada' AND {SALE_FILTER}"),
            params![loja_id, from, to],
            |row| row.get(0),
        )
        .map_err(|e| format!("cancelled count: {e}"))?;

    let (returns_count, returns_total): (i64, f64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(refund_total), 0) FROM returns r
             WHERE r.status IN ('concluida', 'concluida_com_credito')
               AND (?1 IS NULL OR r.loja_id = ?1)
               AND (?2 IS NULL OR r.completed_at >= ?2)
               AND (?3 IS NULL OR r.completed_at <= ?3)",
            params![loja_id, from, to],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| format!("returns totals: {e}"))?;

    let mut by_method = serde_json::Map::new();
    {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT p.method, COALESCE(SUM(p.amount), 0)
                 FROM payments p JOIN sales s ON p.reference_type = 'sale' AND s.id = p.reference_id
                 WHERE s.status != 'cancelada' AND {SALE_FILTER}
                 GROUP BY p.method ORDER BY p.method"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![loja_id, from, to], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(|e| e.to_string())?;
        for (method, sum) in rows.flatten() {
            by_method.insert(method, serde_json::json!(from_cents(to_cents(sum))));
        }
    }

    let top_products = query_all_json(
        &conn,
        &format!(
            "SELECT si.product_id, p.sku, p.name, SUM(si.quantity) AS quantity,
                    ROUND(SUM(si.net_amount), 2) AS net_amount
             FROM sale_items si
             JOIN sales s ON s.id = si.sale_id
             JOIN products p ON p.id = si.product_id
             WHERE s.status != 'cancelada' AND {SALE_FILTER}
             GROUP BY si.product_id
             ORDER BY quantity DESC, net_amount DESC
             LIMIT ?4"
        ),
        params![loja_id, from, to, top],
    )?;

    let net_cents = to_cents(net);
    let returns_cents = to_cents(returns_total);
    Ok(serde_json::json!({
        "lojaId": loja_id,
        "from": from,
        "to": to,
        "salesCount": count,
        "cancelledCount": cancelled,
        "gross": from_cents(to_cents(gross)),
        "discounts": from_cents(to_cents(discounts)),
        "net": from_cents(net_cents),
        "returnsCount": returns_count,
        "returns": from_cents(returns_cents),
        "netAfterReturns": from_cents(net_cents - returns_cents),
        "byPaymentMethod": Value::Object(by_method),
        "topProducts": top_products,
    }))
}
