//! 주문 병합 함수.
//!
//! 주문 업데이트는 누적된 수수료와 체결 목록을 싣지 않는 경우가 많아
//! 이전 상태와 병합한 새 값을 캐시에 넣습니다.

use trader_core::{Fee, Order, TradeTick};

/// 이전 주문 상태와 새 업데이트를 병합합니다.
///
/// - 누적 수수료(`fee`, `fees`)와 체결 목록은 이전 값을 유지
/// - 새 업데이트에 생성 시각이 없으면 이전 시각을 사용
pub fn merge_order(previous: &Order, incoming: Order) -> Order {
    let mut merged = incoming;

    if previous.fee.is_some() {
        merged.fee = previous.fee.clone();
    }
    if !previous.fees.is_empty() {
        merged.fees = previous.fees.clone();
    }
    if merged.trades.is_empty() {
        merged.trades = previous.trades.clone();
    }
    if merged.timestamp.is_none() {
        merged.timestamp = previous.timestamp;
    }
    if merged.client_order_id.is_none() {
        merged.client_order_id = previous.client_order_id.clone();
    }

    merged
}

/// 내 체결을 해당 주문에 반영한 새 주문을 반환합니다.
///
/// 같은 통화의 수수료는 합산하고, 다른 통화가 섞이면 `fees` 목록으로 옮깁니다.
/// 이미 포함된 체결 ID는 다시 추가하지 않습니다.
pub fn fold_trade_into_order(order: &Order, trade: &TradeTick) -> Order {
    let mut folded = order.clone();

    if folded.trades.iter().any(|t| t.id == trade.id) {
        return folded;
    }

    if let Some(trade_fee) = &trade.fee {
        accumulate_fee(&mut folded, trade_fee);
    }
    folded.trades.push(trade.clone());
    folded
}

fn accumulate_fee(order: &mut Order, trade_fee: &Fee) {
    if !order.fees.is_empty() {
        match order
            .fees
            .iter_mut()
            .find(|f| f.currency == trade_fee.currency)
        {
            Some(existing) => existing.cost += trade_fee.cost,
            None => order.fees.push(trade_fee.clone()),
        }
        return;
    }

    match order.fee.take() {
        Some(mut fee) if fee.currency == trade_fee.currency => {
            fee.cost += trade_fee.cost;
            order.fee = Some(fee);
        }
        Some(fee) if fee.currency.is_empty() => {
            order.fee = Some(trade_fee.clone());
        }
        Some(fee) => {
            order.fees = vec![fee, trade_fee.clone()];
        }
        None => {
            order.fee = Some(trade_fee.clone());
        }
    }
}
