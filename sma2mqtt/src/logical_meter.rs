use serde::Serialize;

use crate::aggregation::EvaluationContext;

/// Field every inverter reports its current production in.
pub const PRODUCTION_FIELD: &str = "acPower";

/// Production and consumption of the whole installation.
///
/// Consumption figures need the grid readings of a Home Manager and stay 0
/// without one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalMeter {
    pub total_production: f64,
    pub total_consumption: f64,
    pub solar_consumption: f64,
    pub solar_consumption_percentage: f64,
}

impl LogicalMeter {
    pub fn compute(ctx: &EvaluationContext<'_>) -> Self {
        let total_production: f64 = ctx
            .snapshots
            .values()
            .filter_map(|snapshot| snapshot.get(PRODUCTION_FIELD))
            .filter_map(|value| value.as_f64())
            .sum();

        let Some(frame) = ctx.broadcast else {
            return Self {
                total_production,
                ..Default::default()
            };
        };

        let from_grid = frame.total_power_from_grid;
        let to_grid = frame.total_power_to_grid;
        let solar_consumption = total_production - to_grid;
        let solar_consumption_percentage = if total_production == 0. {
            0.
        } else {
            solar_consumption / total_production * 100.
        };

        Self {
            total_production,
            total_consumption: total_production + from_grid - to_grid,
            solar_consumption,
            solar_consumption_percentage,
        }
    }

    pub fn fields(&self) -> [(&'static str, f64); 4] {
        [
            ("totalProduction", self.total_production),
            ("totalConsumption", self.total_consumption),
            ("solarConsumption", self.solar_consumption),
            ("solarConsumptionPercentage", self.solar_consumption_percentage),
        ]
    }
}
