//! Evaluation of a few side-effect free library methods on known arguments
//!
//! Only methods returning primitives are covered. Folding a method that returns a `String`
//! would replace a fresh object by an interned constant, which is observable through `==`.

use crate::jvm::code::{Literal, Reference};

/// Result of calling `method` on known arguments (receiver first for instance methods)
///
/// Returns `None` if the method is not one we know, or if the call would throw.
pub fn interpret(method: &Reference, args: &[Literal]) -> Option<Literal> {
    match method.class.as_str() {
        "java/lang/String" => string_method(&method.name, &method.descriptor, args),
        "java/lang/Math" => math_method(&method.name, &method.descriptor, args),
        "java/lang/Integer" => match (method.name.as_str(), method.descriptor.as_str(), args) {
            ("parseInt", "(Ljava/lang/String;)I", [Literal::String(s)]) => parse_int(s),
            _ => None,
        },
        _ => None,
    }
}

fn boolean(value: bool) -> Literal {
    Literal::Int(value as i32)
}

fn string_method(name: &str, descriptor: &str, args: &[Literal]) -> Option<Literal> {
    // A `null` receiver throws
    let (receiver, args) = match args.split_first()? {
        (Literal::String(receiver), args) => (receiver, args),
        _ => return None,
    };
    let result = match (name, descriptor, args) {
        ("length", "()I", []) => Literal::Int(receiver.encode_utf16().count() as i32),
        ("isEmpty", "()Z", []) => boolean(receiver.is_empty()),
        ("charAt", "(I)C", [Literal::Int(index)]) => {
            let index = usize::try_from(*index).ok()?;
            Literal::Int(receiver.encode_utf16().nth(index)? as i32)
        }
        ("hashCode", "()I", []) => Literal::Int(
            receiver
                .encode_utf16()
                .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32)),
        ),
        ("equals", "(Ljava/lang/Object;)Z", [Literal::String(other)]) => boolean(receiver == other),
        ("equals", "(Ljava/lang/Object;)Z", [Literal::Null]) => boolean(false),
        _ => return None,
    };
    Some(result)
}

fn math_method(name: &str, descriptor: &str, args: &[Literal]) -> Option<Literal> {
    let result = match (name, descriptor, args) {
        ("abs", "(I)I", [Literal::Int(a)]) => Literal::Int(a.wrapping_abs()),
        ("abs", "(J)J", [Literal::Long(a)]) => Literal::Long(a.wrapping_abs()),
        ("min", "(II)I", [Literal::Int(a), Literal::Int(b)]) => Literal::Int(*a.min(b)),
        ("max", "(II)I", [Literal::Int(a), Literal::Int(b)]) => Literal::Int(*a.max(b)),
        ("min", "(JJ)J", [Literal::Long(a), Literal::Long(b)]) => Literal::Long(*a.min(b)),
        ("max", "(JJ)J", [Literal::Long(a), Literal::Long(b)]) => Literal::Long(*a.max(b)),
        _ => return None,
    };
    Some(result)
}

/// `Integer.parseInt` in radix 10, restricted to ASCII digits
fn parse_int(s: &str) -> Option<Literal> {
    let digits = s.strip_prefix(|c: char| c == '-' || c == '+').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<i32>().ok().map(Literal::Int)
}

#[cfg(test)]
mod test {
    use super::*;

    fn call(class: &str, name: &str, descriptor: &str, args: &[Literal]) -> Option<Literal> {
        interpret(&Reference::new(class, name, descriptor), args)
    }

    fn string(s: &str) -> Literal {
        Literal::String(s.to_owned())
    }

    #[test]
    fn string_methods() {
        let s = "h\u{e9}llo \u{1F600}";
        assert_eq!(call("java/lang/String", "length", "()I", &[string(s)]), Some(Literal::Int(8)));
        assert_eq!(
            call("java/lang/String", "charAt", "(I)C", &[string(s), Literal::Int(1)]),
            Some(Literal::Int(0xe9))
        );
        assert_eq!(
            call("java/lang/String", "charAt", "(I)C", &[string(s), Literal::Int(8)]),
            None
        );
        assert_eq!(
            call("java/lang/String", "hashCode", "()I", &[string("hello")]),
            Some(Literal::Int(99162322))
        );
        assert_eq!(
            call("java/lang/String", "equals", "(Ljava/lang/Object;)Z", &[string("a"), Literal::Null]),
            Some(Literal::Int(0))
        );
        assert_eq!(call("java/lang/String", "length", "()I", &[Literal::Null]), None);
        assert_eq!(call("java/lang/String", "trim", "()Ljava/lang/String;", &[string(" a")]), None);
    }

    #[test]
    fn math_and_parsing() {
        assert_eq!(
            call("java/lang/Math", "abs", "(I)I", &[Literal::Int(i32::MIN)]),
            Some(Literal::Int(i32::MIN))
        );
        assert_eq!(
            call("java/lang/Math", "max", "(JJ)J", &[Literal::Long(-3), Literal::Long(2)]),
            Some(Literal::Long(2))
        );
        let parse = |s: &str| call("java/lang/Integer", "parseInt", "(Ljava/lang/String;)I", &[string(s)]);
        assert_eq!(parse("-42"), Some(Literal::Int(-42)));
        assert_eq!(parse("+7"), Some(Literal::Int(7)));
        assert_eq!(parse("2147483648"), None);
        assert_eq!(parse("-"), None);
        assert_eq!(parse(" 1"), None);
    }
}
