pub mod cart;
pub mod coupon;
pub mod customer;
pub mod product;
