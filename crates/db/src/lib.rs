pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod service;

pub use connection::{connect, connect_with_settings, DbPool};
pub use repositories::{CartStore, RepositoryError, SqlCartStore, SqlCouponUsageRepository};
pub use service::{
    CartCollaborators, CartIssue, CartService, CartSettings, CartValidity, CompletedCart,
};
