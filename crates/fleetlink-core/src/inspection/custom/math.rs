//! Numeric helper functions callable from condition trees.

use crate::campaign::InvocationId;
use crate::inspection::engine::ExpressionError;
use crate::inspection::value::InspectionValue;

use super::CustomFunction;

/// Stateless math helper. `Undefined` inputs yield `Undefined` rather
/// than an error, so a briefly unknown signal does not fault the
/// expression.
#[derive(Debug, Clone, Copy)]
pub enum MathFunction {
    Abs,
    Min,
    Max,
    Pow,
    Log,
    Ceil,
    Floor,
}

impl MathFunction {
    /// Registry names of all math helpers.
    pub const NAMES: &'static [&'static str] =
        &["abs", "min", "max", "pow", "log", "ceil", "floor"];

    /// Look a helper up by its registry name.
    ///
    /// # Panics
    ///
    /// Panics on a name not in [`MathFunction::NAMES`]; callers register
    /// from that list.
    #[must_use]
    pub fn by_name(name: &str) -> Self {
        match name {
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            "pow" => Self::Pow,
            "log" => Self::Log,
            "ceil" => Self::Ceil,
            "floor" => Self::Floor,
            other => panic!("not a math function: {other}"),
        }
    }

    const fn arity(self) -> usize {
        match self {
            Self::Abs | Self::Ceil | Self::Floor => 1,
            Self::Min | Self::Max | Self::Pow | Self::Log => 2,
        }
    }
}

impl CustomFunction for MathFunction {
    fn invoke(
        &mut self,
        _invocation_id: InvocationId,
        args: &[InspectionValue],
    ) -> Result<InspectionValue, ExpressionError> {
        if args.len() != self.arity() {
            return Err(ExpressionError::TypeMismatch);
        }
        if args.iter().any(InspectionValue::is_undefined) {
            return Ok(InspectionValue::Undefined);
        }
        let mut numbers = Vec::with_capacity(args.len());
        for arg in args {
            match arg.as_number() {
                Some(n) => numbers.push(n),
                None => return Err(ExpressionError::TypeMismatch),
            }
        }
        let result = match self {
            Self::Abs => numbers[0].abs(),
            Self::Min => numbers[0].min(numbers[1]),
            Self::Max => numbers[0].max(numbers[1]),
            Self::Pow => numbers[0].powf(numbers[1]),
            Self::Log => {
                // log(base, value)
                let (base, value) = (numbers[0], numbers[1]);
                if base <= 0.0 || base == 1.0 || value <= 0.0 {
                    return Ok(InspectionValue::Undefined);
                }
                value.log(base)
            }
            Self::Ceil => numbers[0].ceil(),
            Self::Floor => numbers[0].floor(),
        };
        if result.is_nan() || result.is_infinite() {
            Ok(InspectionValue::Undefined)
        } else {
            Ok(InspectionValue::Number(result))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoke(function: MathFunction, args: &[InspectionValue]) -> InspectionValue {
        let mut function = function;
        function.invoke(1, args).unwrap()
    }

    #[test]
    fn basic_results() {
        assert_eq!(
            invoke(MathFunction::Abs, &[InspectionValue::Number(-3.5)]),
            InspectionValue::Number(3.5)
        );
        assert_eq!(
            invoke(
                MathFunction::Min,
                &[InspectionValue::Number(2.0), InspectionValue::Number(7.0)]
            ),
            InspectionValue::Number(2.0)
        );
        assert_eq!(
            invoke(
                MathFunction::Pow,
                &[InspectionValue::Number(2.0), InspectionValue::Number(10.0)]
            ),
            InspectionValue::Number(1024.0)
        );
        assert_eq!(
            invoke(
                MathFunction::Log,
                &[InspectionValue::Number(10.0), InspectionValue::Number(1000.0)]
            ),
            InspectionValue::Number(2.9999999999999996)
        );
    }

    #[test]
    fn undefined_inputs_yield_undefined() {
        assert!(invoke(
            MathFunction::Max,
            &[InspectionValue::Undefined, InspectionValue::Number(1.0)]
        )
        .is_undefined());
    }

    #[test]
    fn wrong_arity_is_a_type_mismatch() {
        let mut function = MathFunction::Abs;
        let err = function
            .invoke(1, &[InspectionValue::Number(1.0), InspectionValue::Number(2.0)])
            .unwrap_err();
        assert_eq!(err, ExpressionError::TypeMismatch);
    }

    #[test]
    fn text_argument_is_a_type_mismatch() {
        let mut function = MathFunction::Floor;
        let err = function
            .invoke(1, &[InspectionValue::Text("abc".into())])
            .unwrap_err();
        assert_eq!(err, ExpressionError::TypeMismatch);
    }

    #[test]
    fn invalid_log_domain_is_undefined() {
        assert!(invoke(
            MathFunction::Log,
            &[InspectionValue::Number(-1.0), InspectionValue::Number(10.0)]
        )
        .is_undefined());
    }
}
