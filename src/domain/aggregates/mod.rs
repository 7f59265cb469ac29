//! Aggregates module
pub mod product;
pub mod cart;
pub mod promo;
pub mod user;

pub use product::{Category, Feature, Product, ProductError, ProductWithFeatures, TgCategory, TgCategoryMode, Unit};
pub use cart::{Basket, Cart, CartError, CartItem, CartState, PaidTransition, PricedLine, Quote, StatusEffect};
pub use promo::{expand_codes, Accrual, PromoCode, PromoDescriptor, PromoError};
pub use user::{BotKind, Favourite, TokenRates, UsageTotals, UsedCode, User, UserTokenUsage};
