//! Classification of a price move against one watcher's reminder settings,
//! and the text sent for it.

use crate::config::{Locale, RANGE_NOTIFY_MIN_DELTA, TITLE_MAX_CHARS};
use crate::db::models::{ProductRow, WatchRow};
use crate::types::{Currency, Price, Remind, RemindOption};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceMove {
    /// Point price fell; `percent` is relative to the remembered price.
    Drop { percent: f64 },
    Rise { percent: f64 },
    RangeShift,
}

/// Decides whether moving from `remembered` to `current` is worth a message.
pub fn evaluate(current: Price, remembered: Price, decrease: Remind, increase: Remind) -> Option<PriceMove> {
    match (current, remembered) {
        (Price::Known(now), Price::Known(then)) => {
            if now < then {
                let percent = (1.0 - now / then) * 100.0;
                passes(decrease, percent, now <= decrease.value).then_some(PriceMove::Drop { percent })
            } else if now > then {
                // No percentage exists for a rise from zero; absolute levels still apply.
                let percent = if then > 0.0 { (now / then - 1.0) * 100.0 } else { f64::NAN };
                passes(increase, percent, now >= increase.value).then_some(PriceMove::Rise { percent })
            } else {
                None
            }
        }
        (Price::Range { low: nl, high: nh }, Price::Range { low: ol, high: oh }) => {
            let moved = (nl - ol).abs() >= RANGE_NOTIFY_MIN_DELTA || (nh - oh).abs() >= RANGE_NOTIFY_MIN_DELTA;
            moved.then_some(PriceMove::RangeShift)
        }
        _ => None,
    }
}

fn passes(remind: Remind, percent: f64, absolute_hit: bool) -> bool {
    match remind.option {
        RemindOption::Off => false,
        RemindOption::Absolute => absolute_hit,
        RemindOption::Percentage => remind.value <= percent,
    }
}

/// Cuts `title` to [`TITLE_MAX_CHARS`] characters, marking the cut with "...".
pub fn truncate_title(title: &str) -> String {
    if title.chars().count() <= TITLE_MAX_CHARS {
        return title.to_string();
    }
    let mut cut: String = title.chars().take(TITLE_MAX_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Text for `watch` about the current state of `product`, or None when the
/// watcher's settings suppress it.
pub fn compose(product: &ProductRow, watch: &WatchRow, locale: Locale) -> Option<String> {
    let movement = evaluate(product.price(), watch.price(), watch.decrease(), watch.increase())?;
    let title = truncate_title(&product.title);
    let url = &product.short_url;
    let old = |amount| Currency::format_amount(watch.currency, amount);
    let new = |amount| Currency::format_amount(product.currency, amount);

    let text = match (movement, locale) {
        (PriceMove::Drop { percent }, Locale::Zh) => format!(
            "{title} 降价了，关注价{} 现价{} 降幅{}% {url}",
            old(watch.price),
            new(product.price),
            round_percent(percent),
        ),
        (PriceMove::Drop { percent }, Locale::En) => format!(
            "{title} dropped to {} from {} (-{}%) {url}",
            new(product.price),
            old(watch.price),
            round_percent(percent),
        ),
        (PriceMove::Rise { percent }, Locale::Zh) => format!(
            "{title} 涨价了，关注价{} 现价{} 涨幅{}% {url}",
            old(watch.price),
            new(product.price),
            round_percent(percent),
        ),
        (PriceMove::Rise { percent }, Locale::En) => format!(
            "{title} rose to {} from {} (+{}%) {url}",
            new(product.price),
            old(watch.price),
            round_percent(percent),
        ),
        (PriceMove::RangeShift, Locale::Zh) => format!(
            "{title} 价格有变动，关注价[{}-{}] 现价[{}-{}] {url}",
            old(watch.price_low),
            old(watch.price_high),
            new(product.price_low),
            new(product.price_high),
        ),
        (PriceMove::RangeShift, Locale::En) => format!(
            "{title} price range changed from [{}-{}] to [{}-{}] {url}",
            old(watch.price_low),
            old(watch.price_high),
            new(product.price_low),
            new(product.price_high),
        ),
    };
    Some(text)
}

fn round_percent(percent: f64) -> i64 {
    percent.round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RANGE_PRICE, NO_VALUE};

    fn remind(option: RemindOption, value: f64) -> Remind {
        Remind { option, value }
    }

    const OFF: Remind = Remind { option: RemindOption::Off, value: 0.0 };

    fn product(title: &str, price: (f64, f64, f64)) -> ProductRow {
        ProductRow {
            row_id: 1,
            id: "p1".to_string(),
            source: 0,
            url: "https://item.example/p1".to_string(),
            short_url: "https://s.example/p1".to_string(),
            title: title.to_string(),
            currency: 2,
            price: price.0,
            price_low: price.1,
            price_high: price.2,
            stock: 5,
            sales: 0,
            category: String::new(),
            comments: String::new(),
            update_time: "2024-05-01 10:00:00".to_string(),
        }
    }

    fn watch(price: (f64, f64, f64), decrease: (i64, f64), increase: (i64, f64)) -> WatchRow {
        WatchRow {
            user_id: "alice".to_string(),
            currency: 2,
            price: price.0,
            price_low: price.1,
            price_high: price.2,
            stock: 5,
            watch_time: "2024-05-01 09:00:00".to_string(),
            remind_decrease_option: decrease.0,
            remind_decrease_value: decrease.1,
            remind_increase_option: increase.0,
            remind_increase_value: increase.1,
        }
    }

    #[test]
    fn percentage_threshold_gates_drops() {
        let w = watch((100.0, 0.0, 0.0), (2, 10.0), (0, 0.0));
        let text = compose(&product("Kettle", (88.0, 0.0, 0.0)), &w, Locale::Zh).unwrap();
        assert!(text.contains("88.00"), "{text}");
        assert!(text.contains("12%"), "{text}");
        assert_eq!(text, "Kettle 降价了，关注价$100.00 现价$88.00 降幅12% https://s.example/p1");

        assert_eq!(compose(&product("Kettle", (92.0, 0.0, 0.0)), &w, Locale::Zh), None);
    }

    #[test]
    fn absolute_thresholds_use_price_levels() {
        let drop_to_90 = remind(RemindOption::Absolute, 90.0);
        assert!(evaluate(Price::Known(89.0), Price::Known(100.0), drop_to_90, OFF).is_some());
        assert!(evaluate(Price::Known(90.0), Price::Known(100.0), drop_to_90, OFF).is_some());
        assert!(evaluate(Price::Known(95.0), Price::Known(100.0), drop_to_90, OFF).is_none());

        let rise_to_120 = remind(RemindOption::Absolute, 120.0);
        assert!(evaluate(Price::Known(125.0), Price::Known(100.0), OFF, rise_to_120).is_some());
        assert!(evaluate(Price::Known(110.0), Price::Known(100.0), OFF, rise_to_120).is_none());
    }

    #[test]
    fn rise_from_zero_honours_absolute_levels_only() {
        let rise_to_120 = remind(RemindOption::Absolute, 120.0);
        assert!(matches!(
            evaluate(Price::Known(130.0), Price::Known(0.0), OFF, rise_to_120),
            Some(PriceMove::Rise { .. })
        ));
        assert!(evaluate(Price::Known(110.0), Price::Known(0.0), OFF, rise_to_120).is_none());

        let any_rise = remind(RemindOption::Percentage, 0.0);
        assert!(evaluate(Price::Known(130.0), Price::Known(0.0), OFF, any_rise).is_none());
    }

    #[test]
    fn disabled_direction_and_equal_prices_stay_silent() {
        let any_drop = remind(RemindOption::Percentage, 0.0);
        assert!(evaluate(Price::Known(120.0), Price::Known(100.0), any_drop, OFF).is_none());
        assert!(evaluate(Price::Known(100.0), Price::Known(100.0), any_drop, any_drop).is_none());
        assert!(evaluate(Price::Known(5.0), Price::Known(0.0), OFF, any_drop).is_none());
        assert!(evaluate(Price::Known(5.0), Price::Range { low: 1.0, high: 9.0 }, any_drop, any_drop).is_none());
    }

    #[test]
    fn range_moves_need_a_full_unit() {
        let r = |low, high| Price::Range { low, high };
        assert_eq!(evaluate(r(10.0, 20.0), r(10.5, 20.5), OFF, OFF), None);
        assert_eq!(evaluate(r(9.0, 20.0), r(10.0, 20.0), OFF, OFF), Some(PriceMove::RangeShift));

        let text = compose(
            &product("Lamp", (RANGE_PRICE, 9.0, 20.0)),
            &watch((RANGE_PRICE, 10.0, 20.0), (2, 0.0), (0, 0.0)),
            Locale::En,
        )
        .unwrap();
        assert_eq!(
            text,
            "Lamp price range changed from [$10.00-$20.00] to [$9.00-$20.00] https://s.example/p1"
        );
    }

    #[test]
    fn rise_message_in_english() {
        let w = watch((100.0, 0.0, 0.0), (0, 0.0), (2, 5.0));
        let text = compose(&product("Kettle", (110.0, 0.0, 0.0)), &w, Locale::En).unwrap();
        assert_eq!(text, "Kettle rose to $110.00 from $100.00 (+10%) https://s.example/p1");
        assert!(compose(&product("Kettle", (NO_VALUE, 0.0, 0.0)), &w, Locale::En).is_none());
    }

    #[test]
    fn long_titles_are_cut_by_characters() {
        let title = "超".repeat(31);
        let cut = truncate_title(&title);
        assert_eq!(cut.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_title("short"), "short");
        assert_eq!(truncate_title(&"a".repeat(30)), "a".repeat(30));
    }
}
