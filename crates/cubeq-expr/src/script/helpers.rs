//! Helper functions prepended to generated backend scripts

/// A script helper; each declares the helpers its body calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    GetDocValue,
    Coalesce,
    Minimum,
    Maximum,
    IsNumeric,
    Value2Pipe,
    Date2YearMonth,
    FloorInterval,
}

impl Helper {
    pub fn name(self) -> &'static str {
        match self {
            Helper::GetDocValue => "getDocValue",
            Helper::Coalesce => "coalesce",
            Helper::Minimum => "minimum",
            Helper::Maximum => "maximum",
            Helper::IsNumeric => "isNumeric",
            Helper::Value2Pipe => "Value2Pipe",
            Helper::Date2YearMonth => "Date2YearMonth",
            Helper::FloorInterval => "floorInterval",
        }
    }

    pub fn deps(self) -> &'static [Helper] {
        match self {
            Helper::Minimum | Helper::Maximum => &[Helper::Coalesce],
            Helper::Value2Pipe => &[Helper::IsNumeric],
            _ => &[],
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            Helper::GetDocValue => {
                r#"def getDocValue(name) { var out = doc[name]; if (out == null || out.isEmpty()) return null; return out.value; }"#
            }
            Helper::Coalesce => r#"def coalesce(a, b) { if (a == null) return b; return a; }"#,
            Helper::Minimum => {
                r#"def minimum(a, b) { if (a == null || b == null) return coalesce(a, b); if (a < b) return a; return b; }"#
            }
            Helper::Maximum => {
                r#"def maximum(a, b) { if (a == null || b == null) return coalesce(a, b); if (a > b) return a; return b; }"#
            }
            Helper::IsNumeric => {
                r#"def isNumeric(value) { if (value == null) return false; return ("" + value).matches("^-?[0-9]+(\\.[0-9]+)?([eE][-+]?[0-9]+)?$"); }"#
            }
            Helper::Value2Pipe => {
                r#"def Value2Pipe(value) { if (value == null) return "\\0"; if (isNumeric(value) && !(value is String) && value == Math.floor(value)) value = (long) value; return ("" + value).replace("\\", "\\\\").replace("|", "\\p"); }"#
            }
            Helper::Date2YearMonth => {
                r#"def Date2YearMonth(value) { if (value == null) return null; return new org.joda.time.DateTime(value, org.joda.time.DateTimeZone.UTC).toString("yyyy-MM"); }"#
            }
            Helper::FloorInterval => {
                r#"def floorInterval(value, interval) { if (value == null) return null; return (long) (Math.floor(value / interval) * interval); }"#
            }
        }
    }
}

/// `helpers` closed over their dependencies, dependencies first, each once
pub fn resolve(helpers: &[Helper]) -> Vec<Helper> {
    fn visit(helper: Helper, out: &mut Vec<Helper>) {
        if out.contains(&helper) {
            return;
        }
        for dep in helper.deps() {
            visit(*dep, out);
        }
        out.push(helper);
    }

    let mut out = Vec::new();
    for helper in helpers {
        visit(*helper, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_first_and_once() {
        let order = resolve(&[Helper::Minimum, Helper::Maximum, Helper::Coalesce]);
        assert_eq!(order, vec![Helper::Coalesce, Helper::Minimum, Helper::Maximum]);
    }

    #[test]
    fn test_sources_define_their_names() {
        for helper in resolve(&[
            Helper::GetDocValue,
            Helper::Minimum,
            Helper::Maximum,
            Helper::Value2Pipe,
            Helper::Date2YearMonth,
            Helper::FloorInterval,
        ]) {
            assert!(helper.source().starts_with(&format!("def {}(", helper.name())));
        }
    }
}
