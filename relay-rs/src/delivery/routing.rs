//! Local-domain routing decision

use crate::utils::domain_of;
use std::collections::HashSet;

/// Domains whose recipients are delivered locally
#[derive(Debug, Clone)]
pub struct LocalDomains {
    domains: HashSet<String>,
}

impl LocalDomains {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().trim_end_matches('.').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// A recipient without a domain part is local
    pub fn is_local(&self, recipient: &str) -> bool {
        match domain_of(recipient) {
            Some(domain) => self.domains.contains(&domain),
            None => true,
        }
    }

    /// Recipients that need outbound delivery, in envelope order
    pub fn external_recipients(&self, recipients: &[String]) -> Vec<String> {
        recipients
            .iter()
            .filter(|r| !self.is_local(r))
            .cloned()
            .collect()
    }
}
