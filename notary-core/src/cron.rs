//! Cron items (payment plans and smart contracts)
//!
//! Only the activation and transaction-number contract of a cron item is
//! modelled here. Each party commits an opening and a closing number and
//! signs its own party record together with the item terms, so parties may
//! join in any order without invalidating earlier signatures.

use crate::crypto::Signer;
use crate::types::{AccountId, NotaryId, NymId, OriginType, SignedBy, TransactionNumber};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Kind of cron item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CronItemKind {
    /// Recurring payment between two parties
    PaymentPlan,
    /// Multi-party scripted agreement
    SmartContract,
}

impl CronItemKind {
    /// Origin tag placed on receipts and notices for this kind
    pub fn origin(&self) -> OriginType {
        match self {
            CronItemKind::PaymentPlan => OriginType::PaymentPlan,
            CronItemKind::SmartContract => OriginType::SmartContract,
        }
    }
}

/// One party's commitment to a cron item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronParty {
    /// Party nym
    pub nym_id: NymId,
    /// Party account
    pub account_id: AccountId,
    /// Number opening the party's side
    pub opening_number: TransactionNumber,
    /// Number closed by the party's final receipt
    pub closing_number: TransactionNumber,
    /// Party signature over its record and the terms
    pub signature: Option<SignedBy>,
}

impl CronParty {
    /// Unsigned party record
    pub fn new(
        nym_id: NymId,
        account_id: AccountId,
        opening_number: TransactionNumber,
        closing_number: TransactionNumber,
    ) -> Self {
        Self {
            nym_id,
            account_id,
            opening_number,
            closing_number,
            signature: None,
        }
    }

    /// Both committed numbers
    pub fn numbers(&self) -> [TransactionNumber; 2] {
        [self.opening_number, self.closing_number]
    }
}

/// A payment plan or smart contract awaiting or under cron processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronItem {
    /// Kind
    pub kind: CronItemKind,
    /// Notary
    pub notary_id: NotaryId,
    /// Nym that sends the activation
    pub activator: NymId,
    /// Agreement terms (opaque to the notary core)
    pub terms: String,
    /// Parties
    pub parties: Vec<CronParty>,
    /// End of validity, if any
    pub valid_to: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct PartyBody<'a> {
    kind: CronItemKind,
    notary_id: &'a NotaryId,
    activator: &'a NymId,
    terms: &'a str,
    valid_to: &'a Option<DateTime<Utc>>,
    nym_id: &'a NymId,
    account_id: &'a AccountId,
    opening_number: TransactionNumber,
    closing_number: TransactionNumber,
}

impl CronItem {
    /// Item without parties
    pub fn new(kind: CronItemKind, notary_id: NotaryId, activator: NymId, terms: impl Into<String>) -> Self {
        Self {
            kind,
            notary_id,
            activator,
            terms: terms.into(),
            parties: Vec::new(),
            valid_to: None,
        }
    }

    /// Item ID: the activator's opening number
    pub fn id(&self) -> Option<TransactionNumber> {
        self.party(&self.activator).map(|party| party.opening_number)
    }

    /// Add a party; a nym may join only once and every number is committed once
    pub fn add_party(&mut self, party: CronParty) -> Result<()> {
        if self.is_party(&party.nym_id) {
            return Err(Error::InvalidTransaction(format!(
                "{} is already a party",
                party.nym_id
            )));
        }
        self.parties.push(party);
        if let Err(err) = self.check_numbers() {
            self.parties.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Parties are distinct nyms and no number is committed twice
    fn check_numbers(&self) -> Result<()> {
        let mut nyms = BTreeSet::new();
        let mut numbers = BTreeSet::new();
        for party in &self.parties {
            if !nyms.insert(party.nym_id) {
                return Err(Error::InvalidTransaction(format!(
                    "{} appears twice in the cron item",
                    party.nym_id
                )));
            }
            for number in party.numbers() {
                if !numbers.insert(number) {
                    return Err(Error::InvalidTransaction(format!(
                        "Transaction number {} is committed twice",
                        number
                    )));
                }
            }
        }
        Ok(())
    }

    /// Party record of a nym
    pub fn party(&self, nym_id: &NymId) -> Option<&CronParty> {
        self.parties.iter().find(|party| party.nym_id == *nym_id)
    }

    /// Whether the nym is a party
    pub fn is_party(&self, nym_id: &NymId) -> bool {
        self.party(nym_id).is_some()
    }

    /// Parties other than the activator
    pub fn non_activators(&self) -> impl Iterator<Item = &CronParty> {
        self.parties
            .iter()
            .filter(move |party| party.nym_id != self.activator)
    }

    fn party_bytes(&self, party: &CronParty) -> Result<Vec<u8>> {
        let body = PartyBody {
            kind: self.kind,
            notary_id: &self.notary_id,
            activator: &self.activator,
            terms: &self.terms,
            valid_to: &self.valid_to,
            nym_id: &party.nym_id,
            account_id: &party.account_id,
            opening_number: party.opening_number,
            closing_number: party.closing_number,
        };
        Ok(bincode::serialize(&body)?)
    }

    /// Sign the signer's own party record
    pub fn sign_as(&mut self, signer: &dyn Signer) -> Result<()> {
        let nym_id = signer.nym_id();
        let index = self
            .parties
            .iter()
            .position(|party| party.nym_id == nym_id)
            .ok_or_else(|| Error::InvalidTransaction(format!("{} is not a party", nym_id)))?;

        let bytes = self.party_bytes(&self.parties[index])?;
        self.parties[index].signature = Some(signer.sign_detached(&bytes));
        Ok(())
    }

    /// Verify every party's signature
    pub fn verify_parties(&self) -> Result<()> {
        if self.id().is_none() {
            return Err(Error::InvalidTransaction(
                "Activator is not a party to the cron item".to_string(),
            ));
        }
        self.check_numbers()?;

        for party in &self.parties {
            let signature = party.signature.as_ref().ok_or_else(|| {
                Error::SignatureInvalid(format!("Party {} has not signed", party.nym_id))
            })?;
            if signature.nym_id() != party.nym_id {
                return Err(Error::SignatureInvalid(format!(
                    "Party {} signed with a foreign key",
                    party.nym_id
                )));
            }
            signature.verify(&self.party_bytes(party)?)?;
        }
        Ok(())
    }

    /// Whether the validity window has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_to.map(|end| now > end).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use chrono::Duration;

    fn two_party_item(alice: &KeyPair, bob: &KeyPair) -> CronItem {
        let mut item = CronItem::new(
            CronItemKind::PaymentPlan,
            NotaryId::digest(b"notary"),
            alice.nym_id(),
            "10 per month",
        );
        item.add_party(CronParty::new(alice.nym_id(), AccountId::digest(b"a"), 5, 6))
            .unwrap();
        item.add_party(CronParty::new(bob.nym_id(), AccountId::digest(b"b"), 20, 21))
            .unwrap();
        item
    }

    #[test]
    fn test_signatures_are_order_independent() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut item = two_party_item(&alice, &bob);

        assert!(item.verify_parties().is_err());
        item.sign_as(&bob).unwrap();
        item.sign_as(&alice).unwrap();
        assert!(item.verify_parties().is_ok());
        assert_eq!(item.id(), Some(5));
        assert_eq!(item.non_activators().count(), 1);
    }

    #[test]
    fn test_tampered_numbers_fail_verification() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut item = two_party_item(&alice, &bob);
        item.sign_as(&alice).unwrap();
        item.sign_as(&bob).unwrap();

        item.parties[1].closing_number = 99;
        assert!(matches!(item.verify_parties(), Err(Error::SignatureInvalid(_))));
    }

    #[test]
    fn test_outsider_cannot_sign() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut item = two_party_item(&alice, &bob);
        assert!(item.sign_as(&KeyPair::generate()).is_err());
        assert!(item
            .add_party(CronParty::new(bob.nym_id(), AccountId::digest(b"c"), 1, 2))
            .is_err());
    }

    #[test]
    fn test_repeated_numbers_are_refused() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut item = CronItem::new(
            CronItemKind::SmartContract,
            NotaryId::digest(b"notary"),
            alice.nym_id(),
            "terms",
        );
        item.add_party(CronParty::new(alice.nym_id(), AccountId::digest(b"a"), 5, 6))
            .unwrap();

        let same_twice = CronParty::new(bob.nym_id(), AccountId::digest(b"b"), 20, 20);
        assert!(matches!(item.add_party(same_twice), Err(Error::InvalidTransaction(_))));
        let shared = CronParty::new(bob.nym_id(), AccountId::digest(b"b"), 6, 21);
        assert!(item.add_party(shared).is_err());
        assert_eq!(item.parties.len(), 1);

        // Records pushed past add_party still fail verification
        item.parties.push(CronParty::new(bob.nym_id(), AccountId::digest(b"b"), 20, 20));
        item.sign_as(&alice).unwrap();
        item.sign_as(&bob).unwrap();
        assert!(matches!(item.verify_parties(), Err(Error::InvalidTransaction(_))));
    }

    #[test]
    fn test_duplicate_party_fails_verification() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut item = two_party_item(&alice, &bob);
        item.sign_as(&alice).unwrap();
        item.sign_as(&bob).unwrap();

        let mut again = item.parties[1].clone();
        again.opening_number = 30;
        again.closing_number = 31;
        again.signature = None;
        item.parties.push(again);
        item.sign_as(&bob).unwrap();
        assert!(matches!(item.verify_parties(), Err(Error::InvalidTransaction(_))));
    }

    #[test]
    fn test_expiry() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut item = two_party_item(&alice, &bob);
        let now = Utc::now();
        assert!(!item.is_expired(now));
        item.valid_to = Some(now - Duration::days(1));
        assert!(item.is_expired(now));
        assert_eq!(item.kind.origin(), OriginType::PaymentPlan);
    }
}
