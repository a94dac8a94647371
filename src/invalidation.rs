//! Invalidation rules: which keys and tiers a domain event purges.
//!
//! Resolution is pure; executing the plan against the tiers is the
//! coordinator's job.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::query::QueryKey;

/// Well-known keys shared by the query cache and the memory tier.
pub mod keys {
  use crate::query::QueryKey;

  pub fn product_list() -> QueryKey {
    QueryKey::new(["products"])
  }

  pub fn product_detail(id: &str) -> QueryKey {
    QueryKey::new(["product"]).with(id)
  }

  pub fn cart() -> QueryKey {
    QueryKey::new(["cart"])
  }

  pub fn order_list() -> QueryKey {
    QueryKey::new(["orders"])
  }

  pub fn admin_order_list() -> QueryKey {
    QueryKey::new(["admin", "orders"])
  }

  pub fn user_profile() -> QueryKey {
    QueryKey::new(["user", "profile"])
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
  Product,
  Cart,
  Order,
  User,
  Logout,
}

#[derive(Debug, Error)]
#[error("unknown invalidation domain '{0}' (expected product, cart, order, user or logout)")]
pub struct UnknownDomain(String);

impl FromStr for Domain {
  type Err = UnknownDomain;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "product" | "products" => Ok(Domain::Product),
      "cart" => Ok(Domain::Cart),
      "order" | "orders" => Ok(Domain::Order),
      "user" => Ok(Domain::User),
      "logout" => Ok(Domain::Logout),
      _ => Err(UnknownDomain(s.to_string())),
    }
  }
}

impl fmt::Display for Domain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Domain::Product => "product",
      Domain::Cart => "cart",
      Domain::Order => "order",
      Domain::User => "user",
      Domain::Logout => "logout",
    };
    f.write_str(name)
  }
}

/// A domain change that makes cached data wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
  pub domain: Domain,
  pub entity_id: Option<String>,
}

/// One step of an invalidation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationAction {
  /// Invalidate a key in the query cache and drop it from the memory tier
  Key(QueryKey),
  ClearMemory,
  ClearStore,
  ClearQueries,
  /// CLEAR_CACHE over the control channel
  ClearInterceptor,
}

impl InvalidationEvent {
  pub fn new(domain: Domain, entity_id: Option<String>) -> Self {
    Self { domain, entity_id }
  }

  pub fn product(entity_id: Option<&str>) -> Self {
    Self::new(Domain::Product, entity_id.map(String::from))
  }

  pub fn cart() -> Self {
    Self::new(Domain::Cart, None)
  }

  pub fn order() -> Self {
    Self::new(Domain::Order, None)
  }

  pub fn user() -> Self {
    Self::new(Domain::User, None)
  }

  pub fn logout() -> Self {
    Self::new(Domain::Logout, None)
  }

  /// Resolve the event into independent actions.
  pub fn actions(&self) -> Vec<InvalidationAction> {
    use InvalidationAction::*;

    match self.domain {
      Domain::Product => {
        let mut actions = vec![Key(keys::product_list())];
        if let Some(id) = &self.entity_id {
          actions.push(Key(keys::product_detail(id)));
        }
        actions
      }
      Domain::Cart => vec![Key(keys::cart())],
      Domain::Order => vec![Key(keys::order_list()), Key(keys::admin_order_list())],
      Domain::User => vec![Key(keys::user_profile())],
      Domain::Logout => vec![ClearMemory, ClearStore, ClearQueries, ClearInterceptor],
    }
  }
}
