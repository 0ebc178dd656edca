//! Product catalog.
//!
//! Every tradable instrument is a [`Product`]: symbol, tick size, order size
//! bounds, margin rate, fees, and the oracle-fed mark price. The catalog is
//! loaded once at startup; products can be deactivated (new orders rejected,
//! resting orders stay until cancelled) but never deleted. Reads are
//! snapshot-style and lock-free for callers; writes serialize on the inner
//! lock.

use crate::types::{NumericError, Price, Qty, Quote, Rate, Symbol};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductCategory {
    /// Margined perpetual with funding.
    Perpetual,
    /// Cash-settled spot, no position, direct balance transfer.
    Spot,
    /// Cross-currency pair under the FX band controller.
    Fx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub symbol: Symbol,
    pub category: ProductCategory,
    pub quote_currency: String,
    /// Broker-side symbol for hedgeable products (e.g. "XAU/USD").
    pub external_symbol: Option<String>,
    pub tick_size: Quote,
    pub min_order_size: Qty,
    pub max_order_size: Qty,
    /// Initial margin as a fraction of notional, (0, 1].
    pub margin_rate: Rate,
    pub maker_fee: Rate,
    pub taker_fee: Rate,
    pub mark_price: Price,
    pub last_price: Option<Price>,
    pub funding_rate: Rate,
    pub is_active: bool,
}

impl Product {
    pub fn is_perpetual(&self) -> bool {
        self.category == ProductCategory::Perpetual
    }

    pub fn is_hedgeable(&self) -> bool {
        self.external_symbol.is_some()
    }

    pub fn validate_qty(&self, qty: Qty) -> Result<(), ProductError> {
        if qty < self.min_order_size {
            return Err(ProductError::QtyBelowMinimum {
                qty,
                min: self.min_order_size,
            });
        }
        if qty > self.max_order_size {
            return Err(ProductError::QtyAboveMaximum {
                qty,
                max: self.max_order_size,
            });
        }
        Ok(())
    }

    pub fn validate_price(&self, price: Price) -> Result<(), ProductError> {
        if !price.is_tick_aligned(self.tick_size) {
            return Err(ProductError::PriceNotOnTick {
                price,
                tick: self.tick_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProductError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(Symbol),

    #[error("malformed symbol {0:?}")]
    BadSymbol(String),

    #[error("symbol {0} is not active")]
    Inactive(Symbol),

    #[error("quantity {qty} below minimum {min}")]
    QtyBelowMinimum { qty: Qty, min: Qty },

    #[error("quantity {qty} above maximum {max}")]
    QtyAboveMaximum { qty: Qty, max: Qty },

    #[error("price {price} not a multiple of tick {tick}")]
    PriceNotOnTick { price: Price, tick: Quote },

    #[error("bad numeric input: {0}")]
    Numeric(#[from] NumericError),

    #[error("catalog config: {0}")]
    Config(String),
}

/// Parse a catalog definition from its JSON config source. Floats in the
/// file cross the boundary here, once, through the fixed-point validators
/// in [`ProductCatalog::load`].
pub fn specs_from_json(json: &str) -> Result<Vec<ProductSpec>, ProductError> {
    serde_json::from_str(json).map_err(|e| ProductError::Config(e.to_string()))
}

/// Startup definition for one product, floats at the config boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSpec {
    pub symbol: String,
    pub category: ProductCategory,
    pub quote_currency: String,
    pub external_symbol: Option<String>,
    pub tick_size: f64,
    pub min_order_size: f64,
    pub max_order_size: f64,
    pub margin_rate: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
    pub initial_mark_price: f64,
}

// 3.0: the catalog service. read-mostly; mark price updates are the only
// hot-path write.
#[derive(Debug, Default)]
pub struct ProductCatalog {
    products: RwLock<HashMap<Symbol, Product>>,
}

impl ProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the catalog from config specs. Called once at startup, before
    /// any order flow.
    pub fn load(&self, specs: &[ProductSpec]) -> Result<(), ProductError> {
        let mut products = self.products.write();
        for spec in specs {
            let symbol = Symbol::new(spec.symbol.clone())
                .ok_or_else(|| ProductError::BadSymbol(spec.symbol.clone()))?;
            let product = Product {
                symbol: symbol.clone(),
                category: spec.category,
                quote_currency: spec.quote_currency.clone(),
                external_symbol: spec.external_symbol.clone(),
                tick_size: Quote::from_f64(spec.tick_size)?,
                min_order_size: Qty::from_f64(spec.min_order_size)?,
                max_order_size: Qty::from_f64(spec.max_order_size)?,
                margin_rate: Rate::from_f64(spec.margin_rate)?,
                maker_fee: Rate::from_f64(spec.maker_fee)?,
                taker_fee: Rate::from_f64(spec.taker_fee)?,
                mark_price: Price::from_f64(spec.initial_mark_price)?,
                last_price: None,
                funding_rate: Rate::ZERO,
                is_active: true,
            };
            products.insert(symbol, product);
        }
        Ok(())
    }

    pub fn insert(&self, product: Product) {
        self.products.write().insert(product.symbol.clone(), product);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Product> {
        self.products.read().get(symbol).cloned()
    }

    /// Product lookup that also enforces the active flag, the common
    /// pre-trade path.
    pub fn get_active(&self, symbol: &Symbol) -> Result<Product, ProductError> {
        let products = self.products.read();
        let product = products
            .get(symbol)
            .ok_or_else(|| ProductError::UnknownSymbol(symbol.clone()))?;
        if !product.is_active {
            return Err(ProductError::Inactive(symbol.clone()));
        }
        Ok(product.clone())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.products.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Product> {
        self.products.read().values().cloned().collect()
    }

    /// Deactivation rejects new orders; resting orders remain until
    /// cancelled. Products are never removed.
    pub fn set_active(&self, symbol: &Symbol, active: bool) -> Result<(), ProductError> {
        let mut products = self.products.write();
        let product = products
            .get_mut(symbol)
            .ok_or_else(|| ProductError::UnknownSymbol(symbol.clone()))?;
        product.is_active = active;
        Ok(())
    }

    pub fn set_mark_price(&self, symbol: &Symbol, mark: Price) -> Result<(), ProductError> {
        let mut products = self.products.write();
        let product = products
            .get_mut(symbol)
            .ok_or_else(|| ProductError::UnknownSymbol(symbol.clone()))?;
        product.mark_price = mark;
        Ok(())
    }

    pub fn set_last_price(&self, symbol: &Symbol, last: Price) -> Result<(), ProductError> {
        let mut products = self.products.write();
        let product = products
            .get_mut(symbol)
            .ok_or_else(|| ProductError::UnknownSymbol(symbol.clone()))?;
        product.last_price = Some(last);
        Ok(())
    }

    pub fn set_funding_rate(&self, symbol: &Symbol, rate: Rate) -> Result<(), ProductError> {
        let mut products = self.products.write();
        let product = products
            .get_mut(symbol)
            .ok_or_else(|| ProductError::UnknownSymbol(symbol.clone()))?;
        product.funding_rate = rate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MICRO_SCALE;

    pub(crate) fn gold_perp_spec() -> ProductSpec {
        ProductSpec {
            symbol: "XAU-MNT-PERP".to_string(),
            category: ProductCategory::Perpetual,
            quote_currency: "MNT".to_string(),
            external_symbol: Some("XAU/USD".to_string()),
            tick_size: 0.1,
            min_order_size: 0.01,
            max_order_size: 100.0,
            margin_rate: 0.10,
            maker_fee: 0.0002,
            taker_fee: 0.0005,
            initial_mark_price: 100.0,
        }
    }

    #[test]
    fn load_and_lookup() {
        let catalog = ProductCatalog::new();
        catalog.load(&[gold_perp_spec()]).unwrap();

        let symbol = Symbol::new("XAU-MNT-PERP").unwrap();
        let product = catalog.get_active(&symbol).unwrap();
        assert_eq!(product.margin_rate.ppm(), 100_000);
        assert_eq!(product.taker_fee.ppm(), 500);
        assert_eq!(product.mark_price.micro(), 100 * MICRO_SCALE);
        assert!(product.is_hedgeable());
    }

    #[test]
    fn deactivation_blocks_lookup_but_keeps_product() {
        let catalog = ProductCatalog::new();
        catalog.load(&[gold_perp_spec()]).unwrap();
        let symbol = Symbol::new("XAU-MNT-PERP").unwrap();

        catalog.set_active(&symbol, false).unwrap();
        assert!(matches!(
            catalog.get_active(&symbol),
            Err(ProductError::Inactive(_))
        ));
        assert!(catalog.get(&symbol).is_some());
    }

    #[test]
    fn catalog_loads_from_json_config() {
        let json = r#"[
            {
                "symbol": "XAU-MNT-PERP",
                "category": "Perpetual",
                "quote_currency": "MNT",
                "external_symbol": "XAU/USD",
                "tick_size": 0.1,
                "min_order_size": 0.01,
                "max_order_size": 100.0,
                "margin_rate": 0.10,
                "maker_fee": 0.0002,
                "taker_fee": 0.0005,
                "initial_mark_price": 100.0
            }
        ]"#;

        let specs = specs_from_json(json).unwrap();
        assert_eq!(specs.len(), 1);

        let catalog = ProductCatalog::new();
        catalog.load(&specs).unwrap();
        let product = catalog
            .get(&Symbol::new("XAU-MNT-PERP").unwrap())
            .unwrap();
        assert_eq!(product.margin_rate.ppm(), 100_000);
        assert_eq!(product.external_symbol.as_deref(), Some("XAU/USD"));

        assert!(matches!(
            specs_from_json("not json"),
            Err(ProductError::Config(_))
        ));
    }

    #[test]
    fn qty_bounds_are_inclusive() {
        let catalog = ProductCatalog::new();
        catalog.load(&[gold_perp_spec()]).unwrap();
        let symbol = Symbol::new("XAU-MNT-PERP").unwrap();
        let product = catalog.get(&symbol).unwrap();

        assert!(product.validate_qty(Qty::from_f64(0.01).unwrap()).is_ok());
        assert!(product.validate_qty(Qty::from_f64(100.0).unwrap()).is_ok());
        assert!(product.validate_qty(Qty::from_f64(0.009).unwrap()).is_err());
        assert!(product.validate_qty(Qty::from_f64(100.01).unwrap()).is_err());
    }
}
