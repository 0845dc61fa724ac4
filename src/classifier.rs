// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Assigns Inbox messages to a smart-tab category (§4.8). Pure and
//! synchronous: storage/cache side effects belong to the caller.

use crate::domain::{Category, ClassificationRule, RuleType};

const PROMOTIONS: &[&str] = &[
    "unsubscribe",
    "opt-out",
    "% off",
    "sale",
    "discount",
    "coupon",
    "newsletter",
    "no-reply",
];

const SOCIAL: &[&str] = &[
    "facebook",
    "twitter",
    "linkedin",
    "instagram",
    "pinterest",
    "tiktok",
    "youtube",
    "friend request",
    "follower",
];

const UPDATES: &[&str] = &[
    "receipt",
    "invoice",
    "order",
    "confirmation",
    "tracking",
    "shipped",
    "delivered",
    "security alert",
    "verify",
    "appointment",
    "booking",
];

pub struct ClassifyInput<'a> {
    pub from_address: &'a str,
    pub subject: &'a str,
    pub content: &'a str,
}

/// Rules first, then default keyword sets in order promotions -> social ->
/// updates, else `Primary` (§4.8).
pub fn classify(input: &ClassifyInput, rules: &[ClassificationRule]) -> Category {
    if let Some(rule) = rules.iter().find(|r| rule_matches(r, input)) {
        return rule.category;
    }

    let from = input.from_address.to_lowercase();
    let subject = input.subject.to_lowercase();
    let content = input.content.to_lowercase();
    let haystacks = [from.as_str(), subject.as_str(), content.as_str()];

    if haystacks.iter().any(|h| PROMOTIONS.iter().any(|kw| h.contains(kw))) {
        return Category::Promotions;
    }
    if haystacks.iter().any(|h| SOCIAL.iter().any(|kw| h.contains(kw))) {
        return Category::Social;
    }
    if haystacks.iter().any(|h| UPDATES.iter().any(|kw| h.contains(kw))) {
        return Category::Updates;
    }
    Category::Primary
}

fn rule_matches(rule: &ClassificationRule, input: &ClassifyInput) -> bool {
    let value = rule.value.to_lowercase();
    match rule.rule_type {
        RuleType::From => input.from_address.to_lowercase().contains(&value),
        RuleType::Subject => input.subject.to_lowercase().contains(&value),
        RuleType::Content => input.content.to_lowercase().contains(&value),
    }
}

/// Generic consumer providers where learning by full address makes more
/// sense than by domain (§4.8 "Learning").
const GENERIC_DOMAINS: &[&str] =
    &["gmail.com", "yahoo.com", "outlook.com", "hotmail.com", "icloud.com", "aol.com"];

/// Returns the value a learned `from` rule should key on: the domain for a
/// business sender, the full address for a generic consumer provider.
pub fn learning_key_for_sender(from_address: &str) -> String {
    let lower = from_address.to_lowercase();
    match lower.split('@').nth(1) {
        Some(domain) if GENERIC_DOMAINS.contains(&domain) => lower,
        Some(domain) => domain.to_string(),
        None => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(from: &'a str, subject: &'a str, content: &'a str) -> ClassifyInput<'a> {
        ClassifyInput { from_address: from, subject, content }
    }

    #[test]
    fn user_rule_dominates_keywords() {
        let rules = vec![ClassificationRule {
            user: "u".into(),
            category: Category::Primary,
            rule_type: RuleType::From,
            value: "newsletter@example.com".into(),
        }];
        let got = classify(&input("newsletter@example.com", "50% off sale", ""), &rules);
        assert_eq!(got, Category::Primary);
    }

    #[test]
    fn promotions_keyword_wins_before_social() {
        let got = classify(&input("a@b.com", "Unsubscribe from our Facebook updates", ""), &[]);
        assert_eq!(got, Category::Promotions);
    }

    #[test]
    fn social_keyword_detected() {
        let got = classify(&input("notify@linkedin.com", "You have a new connection", ""), &[]);
        assert_eq!(got, Category::Social);
    }

    #[test]
    fn updates_keyword_detected() {
        let got = classify(&input("shop@store.com", "Your order has shipped", ""), &[]);
        assert_eq!(got, Category::Updates);
    }

    #[test]
    fn default_is_primary() {
        let got = classify(&input("friend@example.com", "Dinner Friday?", ""), &[]);
        assert_eq!(got, Category::Primary);
    }

    #[test]
    fn learning_key_uses_domain_for_business_sender() {
        assert_eq!(learning_key_for_sender("billing@acme-corp.com"), "acme-corp.com");
    }

    #[test]
    fn learning_key_uses_full_address_for_generic_provider() {
        assert_eq!(learning_key_for_sender("jane.doe@gmail.com"), "jane.doe@gmail.com");
    }
}
