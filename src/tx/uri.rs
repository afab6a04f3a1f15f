//! `hush:` payment URIs
//!
//! `hush:<address>?amt=<decimal>&memo=<text>`. `amount` is accepted as an
//! alias of `amt`, and the memo is URL-escaped.

use super::address::Address;
use super::amount::Amount;
use super::request::{Recipient, TransactionRequest};
use crate::error::WalletError;
use crate::node::config::Network;
use std::fmt;
use url::Url;

pub const URI_SCHEME: &str = "hush";

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUri {
    pub address: Address,
    pub amount: Option<Amount>,
    pub memo: Option<String>,
}

impl PaymentUri {
    pub fn parse(uri: &str, network: Network) -> Result<Self, WalletError> {
        let invalid = |msg: String| WalletError::validation("uri", msg);

        let url = Url::parse(uri.trim()).map_err(|e| invalid(format!("not a payment URI: {}", e)))?;
        if !url.scheme().eq_ignore_ascii_case(URI_SCHEME) {
            return Err(invalid(format!("expected a {}: URI", URI_SCHEME)));
        }

        let address = Address::parse_for(url.path(), network).map_err(|e| invalid(e.to_string()))?;

        let mut amount = None;
        let mut memo = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "amt" | "amount" => {
                    let parsed = value
                        .parse::<Amount>()
                        .map_err(|e| WalletError::validation("amount", e.to_string()))?;
                    amount = Some(parsed);
                }
                "memo" => memo = Some(value.into_owned()).filter(|m| !m.is_empty()),
                other => log::debug!("Ignoring payment URI parameter '{}'", other),
            }
        }

        Ok(Self {
            address,
            amount,
            memo,
        })
    }

    /// Single-recipient request; a missing amount fails later validation
    pub fn to_request(&self) -> TransactionRequest {
        let mut recipient = Recipient::new(self.address.clone(), self.amount.unwrap_or(Amount::ZERO));
        recipient.memo = self.memo.clone();
        TransactionRequest::new(vec![recipient])
    }
}

impl fmt::Display for PaymentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", URI_SCHEME, self.address)?;
        let mut separator = '?';
        if let Some(amount) = self.amount {
            write!(f, "{}amt={}", separator, amount)?;
            separator = '&';
        }
        if let Some(memo) = &self.memo {
            let escaped: String = url::form_urlencoded::byte_serialize(memo.as_bytes()).collect();
            write!(f, "{}memo={}", separator, escaped)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::address::fixtures::*;
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri = format!("hush:{}?amt=1.5&memo=Thanks%20for%20lunch", z_main('q'));
        let parsed = PaymentUri::parse(&uri, Network::Mainnet).unwrap();
        assert!(parsed.address.is_shielded());
        assert_eq!(parsed.amount.unwrap().minor(), 150_000_000);
        assert_eq!(parsed.memo.as_deref(), Some("Thanks for lunch"));

        let request = parsed.to_request();
        assert_eq!(request.recipients.len(), 1);
        assert!(request.validate(Network::Mainnet).is_ok());
    }

    #[test]
    fn test_amount_alias_and_bare_address() {
        let uri = format!("hush:{}?amount=0.001", t_main('a'));
        let parsed = PaymentUri::parse(&uri, Network::Mainnet).unwrap();
        assert_eq!(parsed.amount.unwrap().minor(), 100_000);

        let parsed = PaymentUri::parse(&format!("hush:{}", t_main('a')), Network::Mainnet).unwrap();
        assert_eq!(parsed.amount, None);
        assert!(parsed.to_request().validate(Network::Mainnet).is_err());
    }

    #[test]
    fn test_rejects_other_schemes_and_bad_amounts() {
        let err = PaymentUri::parse(&format!("zcash:{}", t_main('a')), Network::Mainnet).unwrap_err();
        assert!(matches!(err, WalletError::Validation { ref field, .. } if field == "uri"));

        let err = PaymentUri::parse(&format!("hush:{}?amt=-2", t_main('a')), Network::Mainnet).unwrap_err();
        assert!(matches!(err, WalletError::Validation { ref field, .. } if field == "amount"));
    }

    #[test]
    fn test_display_escapes_memo() {
        let uri = PaymentUri {
            address: Address::parse(&z_main('q')).unwrap(),
            amount: Some(Amount::from_minor(2_500_000).unwrap()),
            memo: Some("a&b c".into()),
        };
        let text = uri.to_string();
        assert!(text.ends_with("?amt=0.025&memo=a%26b+c"));
        assert_eq!(PaymentUri::parse(&text, Network::Mainnet).unwrap(), uri);
    }
}
