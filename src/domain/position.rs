//! Signed net position for one instrument
//!
//! A position is a side plus a non-negative magnitude. The constructors keep
//! `magnitude == 0 <=> side == Flat`, so every `Position` value in the crate
//! satisfies the invariant.

use rust_decimal::Decimal;
use serde::Serialize;

use super::OrderSide;
use crate::error::{PosguardError, Result};

/// Direction of the net position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
            PositionSide::Flat => "FLAT",
        }
    }
}

impl From<OrderSide> for PositionSide {
    fn from(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Position {
    side: PositionSide,
    magnitude: Decimal,
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}

impl Position {
    pub fn flat() -> Self {
        Self {
            side: PositionSide::Flat,
            magnitude: Decimal::ZERO,
        }
    }

    /// Build a position, normalizing a zero magnitude to `Flat`.
    pub fn new(side: PositionSide, magnitude: Decimal) -> Result<Self> {
        if magnitude.is_sign_negative() && !magnitude.is_zero() {
            return Err(PosguardError::Validation(format!(
                "position magnitude must be non-negative, got {}",
                magnitude
            )));
        }

        if magnitude.is_zero() || side == PositionSide::Flat {
            if side == PositionSide::Flat && !magnitude.is_zero() {
                return Err(PosguardError::Validation(format!(
                    "flat position cannot carry magnitude {}",
                    magnitude
                )));
            }
            return Ok(Self::flat());
        }

        Ok(Self {
            side,
            magnitude: magnitude.normalize(),
        })
    }

    pub fn long(magnitude: Decimal) -> Result<Self> {
        Self::new(PositionSide::Long, magnitude)
    }

    pub fn short(magnitude: Decimal) -> Result<Self> {
        Self::new(PositionSide::Short, magnitude)
    }

    /// Inverse of [`Position::signed`]: positive is long, negative is short.
    pub fn from_signed(value: Decimal) -> Self {
        if value.is_zero() {
            Self::flat()
        } else if value.is_sign_positive() {
            Self {
                side: PositionSide::Long,
                magnitude: value.normalize(),
            }
        } else {
            Self {
                side: PositionSide::Short,
                magnitude: value.abs().normalize(),
            }
        }
    }

    pub fn side(&self) -> PositionSide {
        self.side
    }

    pub fn magnitude(&self) -> Decimal {
        self.magnitude
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat
    }

    /// Signed quantity: `+magnitude` long, `-magnitude` short, zero flat.
    pub fn signed(&self) -> Decimal {
        match self.side {
            PositionSide::Long => self.magnitude,
            PositionSide::Short => -self.magnitude,
            PositionSide::Flat => Decimal::ZERO,
        }
    }

    /// Net a fill of `quantity` on `side` against this position.
    ///
    /// Callers guarantee `quantity >= 0`; the ledger rejects negative sizes
    /// before they get here.
    pub fn net(&self, side: OrderSide, quantity: Decimal) -> Self {
        if quantity.is_zero() {
            return *self;
        }

        let fill_side = PositionSide::from(side);

        if self.is_flat() {
            return Self {
                side: fill_side,
                magnitude: quantity.normalize(),
            };
        }

        if fill_side == self.side {
            return Self {
                side: self.side,
                magnitude: (self.magnitude + quantity).normalize(),
            };
        }

        let net = self.magnitude - quantity;
        if net.is_zero() {
            Self::flat()
        } else if net.is_sign_positive() {
            // Partial fill against the resting position
            Self {
                side: self.side,
                magnitude: net.normalize(),
            }
        } else {
            // Fill overshoots, side flips
            Self {
                side: fill_side,
                magnitude: net.abs().normalize(),
            }
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.side {
            PositionSide::Flat => write!(f, "FLAT"),
            side => write!(f, "{} {}", side, self.magnitude),
        }
    }
}
