use super::types::{AssetClass, AssetReturns};

/// Fixed-capacity ring of monthly growth factors with an incrementally maintained product.
#[derive(Clone, Debug)]
pub struct RollingWindow {
    capacity: usize,
    factors: Vec<f64>,
    next: usize,
    product: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            factors: Vec::with_capacity(capacity),
            next: 0,
            product: 1.0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.factors.len() == self.capacity
    }

    pub fn push(&mut self, factor: f64) {
        if !self.is_full() {
            self.factors.push(factor);
            self.product *= factor;
            return;
        }

        let evicted = std::mem::replace(&mut self.factors[self.next], factor);
        self.next = (self.next + 1) % self.capacity;
        if evicted.abs() > 1e-12 && self.product.is_finite() {
            self.product = self.product / evicted * factor;
        } else {
            self.product = self.factors.iter().product();
        }
    }

    /// `product^(12 / capacity) - 1`, or `None` until the window is full.
    pub fn annualized(&self) -> Option<f64> {
        if !self.is_full() {
            return None;
        }
        Some(self.product.max(0.0).powf(12.0 / self.capacity as f64) - 1.0)
    }
}

/// One trailing window of real (inflation-adjusted) growth per asset class.
#[derive(Clone, Debug)]
pub struct RollingRealReturns {
    stocks: RollingWindow,
    bonds: RollingWindow,
    cash: RollingWindow,
}

impl RollingRealReturns {
    pub fn new(lookback_months: usize) -> Self {
        Self {
            stocks: RollingWindow::new(lookback_months),
            bonds: RollingWindow::new(lookback_months),
            cash: RollingWindow::new(lookback_months),
        }
    }

    fn window_mut(&mut self, asset: AssetClass) -> &mut RollingWindow {
        match asset {
            AssetClass::Stocks => &mut self.stocks,
            AssetClass::Bonds => &mut self.bonds,
            AssetClass::Cash => &mut self.cash,
        }
    }

    pub fn push(&mut self, nominal: &AssetReturns, monthly_inflation: f64) {
        for asset in AssetClass::ALL {
            let real_factor = (1.0 + nominal.get(asset)) / (1.0 + monthly_inflation);
            self.window_mut(asset).push(real_factor);
        }
    }

    pub fn annualized(&self) -> Option<AssetReturns> {
        Some(AssetReturns::new(
            self.stocks.annualized()?,
            self.bonds.annualized()?,
            self.cash.annualized()?,
        ))
    }
}
