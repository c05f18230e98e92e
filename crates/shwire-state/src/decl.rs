//! Parser for single variable declarations printed by `declare -p` (bash)
//! and `typeset -p` (zsh).

use crate::lex::Lexer;
use crate::{ShellVar, StateError, VarFlags, VarValue};
use std::collections::BTreeMap;

/// Parse one declaration record into `(name, var)` entries.
///
/// Tied zsh pairs (`typeset -T SCALAR array=(...)`) yield two entries, one
/// per side.
pub(crate) fn parse_declaration(record: &str) -> Result<Vec<(String, ShellVar)>, StateError> {
    let record = record.strip_suffix('\n').unwrap_or(record);
    let mut lex = Lexer::new(record);
    lex.skip_ws();

    let mut flags = VarFlags::default();
    let keyword = lex.word(&[])?;
    match keyword.as_str() {
        "declare" | "typeset" | "local" | "float" => {}
        "export" => flags.exported = true,
        "readonly" => flags.readonly = true,
        "integer" => flags.integer = true,
        other => {
            return Err(StateError::InvalidCapture(format!("not a declaration: {:?}", other)));
        }
    }

    loop {
        lex.skip_blank();
        match lex.peek() {
            Some('-') | Some('+') => {
                let word = lex.word(&[])?;
                flags.apply_flag_word(&word);
            }
            _ => break,
        }
    }

    let mut names: Vec<String> = Vec::new();
    let mut value = VarValue::Unset;
    loop {
        lex.skip_blank();
        if lex.is_empty() || lex.peek() == Some('\n') {
            break;
        }
        let name = lex.raw_name();
        if name.is_empty() {
            return Err(StateError::InvalidCapture(format!("bad declaration: {:?}", record)));
        }
        names.push(name.to_string());
        if lex.eat('=') {
            value = parse_value(&mut lex, &flags).map_err(|e| value_error(e, name))?;
            break;
        }
    }

    // Older zsh prints arrays as `typeset -a name` followed by `name=(...)`.
    if value == VarValue::Unset {
        if let Some(last) = names.last() {
            lex.skip_ws();
            let assign = format!("{}=", last);
            if lex.rest().starts_with(&assign) {
                lex.advance(assign.len());
                value = parse_value(&mut lex, &flags).map_err(|e| value_error(e, last))?;
            }
        }
    }

    match names.len() {
        0 => Err(StateError::InvalidCapture(format!("declaration without a name: {:?}", record))),
        1 => {
            let name = names.remove(0);
            Ok(vec![(
                name,
                ShellVar {
                    flags,
                    value,
                    tied_to: None,
                },
            )])
        }
        2 => {
            let array_name = names.remove(1);
            let scalar_name = names.remove(0);
            let array = ShellVar {
                flags: VarFlags {
                    exported: false,
                    array: true,
                    tied: true,
                    ..flags
                },
                value,
                tied_to: Some(scalar_name.clone()),
            };
            let scalar = ShellVar {
                flags: VarFlags {
                    exported: flags.exported,
                    readonly: flags.readonly,
                    tied: true,
                    ..VarFlags::default()
                },
                value: VarValue::Unset,
                tied_to: Some(array_name.clone()),
            };
            Ok(vec![(array_name, array), (scalar_name, scalar)])
        }
        _ => Err(StateError::InvalidCapture(format!("too many names in declaration: {:?}", record))),
    }
}

fn value_error(err: StateError, name: &str) -> StateError {
    match err {
        StateError::NonUtf8(_) => StateError::NonUtf8(format!("variable {}", name)),
        other => other,
    }
}

fn parse_value(lex: &mut Lexer<'_>, flags: &VarFlags) -> Result<VarValue, StateError> {
    if !lex.eat('(') {
        return Ok(VarValue::Scalar(lex.word(&[])?));
    }

    let mut keyed: Vec<(String, String)> = Vec::new();
    let mut plain: Vec<String> = Vec::new();
    loop {
        lex.skip_ws();
        match lex.peek() {
            None => return Err(StateError::InvalidCapture("unterminated array".to_string())),
            Some(')') => {
                lex.eat(')');
                break;
            }
            Some('[') => {
                lex.eat('[');
                let key = lex.word(&[']'])?;
                if !(lex.eat(']') && lex.eat('=')) {
                    return Err(StateError::InvalidCapture(format!("bad array subscript {:?}", key)));
                }
                let element = lex.word(&[')'])?;
                keyed.push((key, element));
            }
            Some(_) => plain.push(lex.word(&[')'])?),
        }
    }

    if flags.assoc {
        let mut map: BTreeMap<String, String> = keyed.into_iter().collect();
        let mut pairs = plain.into_iter();
        while let Some(key) = pairs.next() {
            map.insert(key, pairs.next().unwrap_or_default());
        }
        return Ok(VarValue::Assoc(map));
    }

    let mut items: Vec<String> = keyed.into_iter().map(|(_, v)| v).collect();
    items.extend(plain);
    Ok(VarValue::Array(items))
}
