//! Subject-line classifier for transactional-only enforcement.
//!
//! A single ordered rule table: the first keyword contained in the
//! lower-cased subject decides the verdict. Transactional rules are listed
//! ahead of marketing rules, so a subject carrying both kinds of signal
//! ("Order Confirmation - 20% off your next order") is kept.
//!
//! Subjects matching nothing are classified as marketing.

use serde::Serialize;

/// Reason reported when no rule matches.
pub const DEFAULT_REASON: &str = "unclassified, defaulted to marketing";

/// Verdict for a single subject line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub is_transactional: bool,
    pub reason: String,
}

/// One row of the rule table. `keyword` must be lower-case.
#[derive(Debug, Clone, Copy)]
pub struct SubjectRule {
    pub keyword: &'static str,
    pub reason: &'static str,
    pub transactional: bool,
}

const fn keep(keyword: &'static str, reason: &'static str) -> SubjectRule {
    SubjectRule {
        keyword,
        reason,
        transactional: true,
    }
}

const fn discard(keyword: &'static str, reason: &'static str) -> SubjectRule {
    SubjectRule {
        keyword,
        reason,
        transactional: false,
    }
}

/// Rules in evaluation order.
pub static RULES: &[SubjectRule] = &[
    // Orders
    keep("order confirm", "Order confirmation"),
    keep("order placed", "Order confirmation"),
    keep("order received", "Order confirmation"),
    // Shipping and delivery
    keep("shipped", "Shipping notification"),
    keep("shipping confirm", "Shipping notification"),
    keep("shipping update", "Shipping notification"),
    keep("shipment", "Shipping notification"),
    keep("out for delivery", "Delivery update"),
    keep("delivery confirm", "Delivery update"),
    keep("delivery update", "Delivery update"),
    keep("delivered", "Delivery update"),
    keep("delivery", "Delivery update"),
    keep("in transit", "Tracking update"),
    keep("tracking", "Tracking update"),
    keep("package", "Delivery update"),
    // Order status, after shipping so "your order has shipped" reports shipping
    keep("your order", "Order notification"),
    keep("order #", "Order notification"),
    keep("order number", "Order notification"),
    keep("order status", "Order notification"),
    keep("order update", "Order notification"),
    // Receipts and payments
    keep("receipt", "Receipt"),
    keep("invoice", "Invoice"),
    keep("payment confirm", "Payment notification"),
    keep("payment received", "Payment notification"),
    keep("purchase confirm", "Payment notification"),
    keep("transaction", "Payment notification"),
    keep("payment", "Payment notification"),
    // Account security
    keep("password reset", "Security/Account"),
    keep("security alert", "Security/Account"),
    keep("login attempt", "Security/Account"),
    keep("verify your", "Account verification"),
    keep("verification", "Account verification"),
    keep("account confirm", "Account verification"),
    keep("subscription confirm", "Subscription confirmation"),
    // Bookings
    keep("booking confirm", "Booking confirmation"),
    keep("reservation", "Reservation"),
    keep("itinerary", "Travel itinerary"),
    keep("appointment", "Appointment"),
    keep("ticket", "Ticket"),
    // Refunds and returns
    keep("refund", "Refund notification"),
    keep("return confirm", "Return notification"),
    keep("return label", "Return notification"),
    keep("exchange", "Return notification"),
    keep("return", "Return notification"),
    // Promotions
    discard("flash sale", "Flash sale promotion"),
    discard("% off", "Discount promotion"),
    discard("sale", "Sale promotion"),
    discard("deal", "Deal promotion"),
    discard("discount", "Discount promotion"),
    discard("save $", "Discount promotion"),
    discard("save up to", "Discount promotion"),
    discard("coupon", "Discount promotion"),
    discard("promo", "Discount promotion"),
    discard("clearance", "Sale promotion"),
    discard("black friday", "Seasonal promotion"),
    discard("cyber monday", "Seasonal promotion"),
    discard("holiday", "Seasonal promotion"),
    discard("special offer", "Special offer"),
    discard("exclusive offer", "Special offer"),
    discard("limited time", "Marketing urgency"),
    // Newsletters
    discard("newsletter", "Newsletter"),
    discard("digest", "Newsletter"),
    discard("roundup", "Newsletter"),
    discard("weekly", "Newsletter"),
    discard("monthly", "Newsletter"),
    discard("what's new", "Product marketing"),
    discard("new arrivals", "Product marketing"),
    discard("new collection", "Product marketing"),
    discard("just dropped", "Product marketing"),
    discard("introducing", "Product marketing"),
    discard("trending", "Recommendation marketing"),
    discard("top picks", "Recommendation marketing"),
    discard("recommended", "Recommendation marketing"),
    discard("you might like", "Recommendation marketing"),
    discard("based on your", "Recommendation marketing"),
    // Urgency and engagement bait
    discard("don't miss", "Marketing urgency"),
    discard("last chance", "Marketing urgency"),
    discard("ending soon", "Marketing urgency"),
    discard("only hours left", "Marketing urgency"),
    discard("act now", "Marketing urgency"),
    discard("hurry", "Marketing urgency"),
    discard("reminder:", "Marketing urgency"),
    discard("we miss you", "Re-engagement"),
    discard("come back", "Re-engagement"),
    // Calls to action
    discard("shop now", "Marketing CTA"),
    discard("buy now", "Marketing CTA"),
    discard("free shipping", "Marketing CTA"),
    discard("check out", "Marketing CTA"),
    discard("discover", "Marketing CTA"),
    discard("explore", "Marketing CTA"),
];

/// Classify a subject line. Pure and case-insensitive.
pub fn classify(subject: &str) -> Classification {
    let lower = subject.to_lowercase();

    RULES
        .iter()
        .find(|rule| lower.contains(rule.keyword))
        .map(|rule| Classification {
            is_transactional: rule.transactional,
            reason: rule.reason.to_string(),
        })
        .unwrap_or_else(|| Classification {
            is_transactional: false,
            reason: DEFAULT_REASON.to_string(),
        })
}
