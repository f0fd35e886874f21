/// Format a rial amount with thousands separators: 1,250,000. Fractions are
/// only shown when present.
pub fn rial(val: f64) -> String {
    let negative = val < 0.0;
    let abs = val.abs();
    let fixed = format!("{:.2}", abs);
    let (int_part, dec_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut with_commas = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_commas.push(',');
        }
        with_commas.push(c);
    }
    let mut out: String = with_commas.chars().rev().collect();
    if dec_part != "00" {
        out.push('.');
        out.push_str(dec_part);
    }

    if negative {
        format!("-{out}")
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rial_formatting() {
        assert_eq!(rial(1_250_000.0), "1,250,000");
        assert_eq!(rial(-500.0), "-500");
        assert_eq!(rial(0.0), "0");
        assert_eq!(rial(1000.5), "1,000.50");
        assert_eq!(rial(100_000.0), "100,000");
    }
}
