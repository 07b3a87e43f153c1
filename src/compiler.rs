//! Reference front end: turns script source into a [`Module`] of command graphs.
//!
//! ```text
//! import Util from 'util.isl';
//!
//! @defaultCache
//! fun run($input) {
//!     $total = 0;
//!     foreach $item in $input.items {
//!         if ($item.price > 10) { $big = @.Util.tag($item) }
//!     }
//!     return { name: $input.name | upper, total: $total };
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::commands::{
    ArrayBuild, Assign, Call, CommandRef, Condition, ForEach, If, Literal, ModifierCall, ModuleCall,
    ObjectBuild, ParallelForEach, PathSegment, Return, StatementCall, Statements, VariableSelector,
};
use crate::errors::{IslError, Result};
use crate::module::{AnnotationUse, FunctionDeclaration, FunctionKind, Module};
use crate::package::{FileInfo, ModuleCompiler, ModuleLinker};
use crate::parser::Parser;

const SYMBOL_OPERATORS: [&str; 6] = ["==", "!=", "<=", ">=", "<", ">"];

/// Compiles `.isl` script text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptCompiler;

impl ModuleCompiler for ScriptCompiler {
    fn compile(&self, file: &FileInfo, linker: &mut dyn ModuleLinker) -> Result<Arc<Module>> {
        let mut unit = Unit {
            p: Parser::with_file(&file.source, &file.name),
            module: &file.name,
            imports: HashMap::new(),
            linker,
        };
        let (imports, declarations) = unit.parse_module().map_err(|e| match e {
            IslError::Parse { message, position } => IslError::compilation(
                format!("Could not compile {}: {message}", file.name),
                Some(position),
                Some(&file.source),
            ),
            other => other,
        })?;
        debug!(module = %file.name, functions = declarations.len(), "compiled module");
        Ok(Module::new(file.name.clone(), imports, declarations))
    }
}

/// Module name addressed by an import path: `lib/util.isl` imports `util`.
pub fn module_name_from_path(path: &str) -> String {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    file.strip_suffix(".isl").unwrap_or(file).to_string()
}

fn literal(value: Value) -> CommandRef {
    Arc::new(Literal(value))
}

struct Unit<'a, 'l> {
    p: Parser<'a>,
    module: &'a str,
    /// Import alias (lowercase) to linked module.
    imports: HashMap<String, Arc<Module>>,
    linker: &'l mut dyn ModuleLinker,
}

impl Unit<'_, '_> {
    fn parse_module(&mut self) -> Result<(Vec<String>, Vec<FunctionDeclaration>)> {
        let mut imports = Vec::new();
        let mut declarations = Vec::new();
        loop {
            self.p.skip_ws();
            if self.p.eof() {
                break;
            }
            if self.p.consume_keyword("import") {
                imports.push(self.parse_import()?);
                continue;
            }
            declarations.push(self.parse_function()?);
        }
        Ok((imports, declarations))
    }

    fn parse_import(&mut self) -> Result<String> {
        self.p.skip_ws();
        let alias = self.p.parse_identifier()?;
        self.p.skip_ws();
        if !self.p.consume_keyword("from") {
            return Err(self.p.error("expected 'from'"));
        }
        self.p.skip_ws();
        let path = self.p.parse_quoted_string()?;
        self.p.skip_ws();
        self.p.consume_char(';');

        let target = module_name_from_path(&path);
        let module = self.linker.link(self.module, &target)?;
        let name = module.name().to_string();
        self.imports.insert(alias.to_lowercase(), module);
        Ok(name)
    }

    fn parse_function(&mut self) -> Result<FunctionDeclaration> {
        let mut annotations = Vec::new();
        loop {
            self.p.skip_ws();
            if self.p.peek_char() != Some('@') {
                break;
            }
            let position = self.p.position();
            self.p.consume_char('@');
            let name = self.p.parse_identifier()?;
            self.p.skip_ws();
            let arguments = if self.p.peek_char() == Some('(') {
                self.parse_arguments()?
            } else {
                Vec::new()
            };
            annotations.push(AnnotationUse {
                name,
                arguments,
                position: Some(position),
            });
        }

        self.p.skip_ws();
        let position = self.p.position();
        let kind = if self.p.consume_keyword("fun") {
            FunctionKind::Function
        } else if self.p.consume_keyword("modifier") {
            FunctionKind::Modifier
        } else {
            return Err(self.p.error("expected 'fun' or 'modifier'"));
        };
        self.p.skip_ws();
        let name = self.p.parse_identifier()?;

        self.p.expect('(')?;
        let mut parameters = Vec::new();
        loop {
            self.p.skip_ws();
            if self.p.consume_char(')') {
                break;
            }
            parameters.push(self.p.parse_variable()?);
            self.p.skip_ws();
            if !self.p.consume_char(',') {
                self.p.expect(')')?;
                break;
            }
        }
        let body = self.parse_block()?;

        Ok(FunctionDeclaration {
            name,
            kind,
            parameters,
            annotations,
            body,
            position: Some(position),
        })
    }

    fn parse_block(&mut self) -> Result<CommandRef> {
        self.p.expect('{')?;
        let mut statements = Vec::new();
        loop {
            self.p.skip_ws();
            if self.p.consume_char('}') {
                break;
            }
            if self.p.eof() {
                return Err(self.p.error("expected '}'"));
            }
            statements.push(self.parse_statement()?);
        }
        Ok(Arc::new(Statements(statements)))
    }

    fn end_statement(&mut self) {
        self.p.skip_ws();
        self.p.consume_char(';');
    }

    fn parse_statement(&mut self) -> Result<CommandRef> {
        self.p.skip_ws();
        if self.p.consume_keyword("return") {
            self.p.skip_ws();
            let value = match self.p.peek_char() {
                Some(';') | Some('}') | None => None,
                _ => Some(self.parse_expression(true)?),
            };
            self.end_statement();
            return Ok(Arc::new(Return(value)));
        }
        if self.p.consume_keyword("if") {
            return self.parse_if();
        }
        if let Some(looped) = self.parse_loop()? {
            self.end_statement();
            return Ok(looped);
        }
        if self.p.peek_char() == Some('$') {
            let mark = self.p.mark();
            let name = self.p.parse_variable()?;
            let path = self.parse_path()?;
            self.p.skip_ws();
            if self.p.peek_char() == Some('=') && self.p.peek_nth(1) != Some('=') {
                self.p.consume_char('=');
                let value = self.parse_expression(true)?;
                self.end_statement();
                return Ok(Arc::new(Assign { name, path, value }));
            }
            self.p.reset(mark);
        }
        let expression = self.parse_expression(true)?;
        self.end_statement();
        Ok(expression)
    }

    fn parse_if(&mut self) -> Result<CommandRef> {
        self.p.expect('(')?;
        let condition = self.parse_condition()?;
        self.p.expect(')')?;
        let then = self.parse_branch()?;

        self.p.skip_ws();
        let otherwise = if self.p.consume_keyword("else") {
            self.p.skip_ws();
            if self.p.consume_keyword("if") {
                Some(self.parse_if()?)
            } else {
                Some(self.parse_branch()?)
            }
        } else {
            None
        };
        Ok(Arc::new(If {
            condition,
            then,
            otherwise,
        }))
    }

    fn parse_branch(&mut self) -> Result<CommandRef> {
        self.p.skip_ws();
        if self.p.peek_char() == Some('{') {
            self.parse_block()
        } else {
            self.parse_statement()
        }
    }

    /// `foreach ...` or `parallel {options} foreach ...`, usable as a value.
    fn parse_loop(&mut self) -> Result<Option<CommandRef>> {
        if self.p.consume_keyword("foreach") {
            return Ok(Some(Arc::new(self.parse_foreach()?)));
        }
        if !self.p.consume_keyword("parallel") {
            return Ok(None);
        }
        self.p.skip_ws();
        let options = if self.p.peek_char() == Some('{') {
            Some(self.parse_object()?)
        } else {
            None
        };
        self.p.skip_ws();
        if !self.p.consume_keyword("foreach") {
            return Err(self.p.error("expected 'foreach' after 'parallel'"));
        }
        let inner = self.parse_foreach()?;
        Ok(Some(Arc::new(ParallelForEach { inner, options })))
    }

    fn parse_foreach(&mut self) -> Result<ForEach> {
        self.p.skip_ws();
        let iterator = self.p.parse_variable()?;
        self.p.skip_ws();
        if !self.p.consume_keyword("in") {
            return Err(self.p.error("expected 'in'"));
        }
        let source = self.parse_expression(false)?;
        let body = self.parse_block()?;
        Ok(ForEach {
            iterator,
            source,
            body,
        })
    }

    fn parse_condition(&mut self) -> Result<Condition> {
        let mut parts = vec![self.parse_and()?];
        loop {
            self.p.skip_ws();
            if self.p.consume_str("||") || self.p.consume_keyword("or") {
                parts.push(self.parse_and()?);
            } else {
                break;
            }
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::Any(parts)
        })
    }

    fn parse_and(&mut self) -> Result<Condition> {
        let mut parts = vec![self.parse_unary()?];
        loop {
            self.p.skip_ws();
            if self.p.consume_str("&&") || self.p.consume_keyword("and") {
                parts.push(self.parse_unary()?);
            } else {
                break;
            }
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::All(parts)
        })
    }

    fn parse_unary(&mut self) -> Result<Condition> {
        self.p.skip_ws();
        if self.p.peek_char() == Some('!') && self.p.peek_nth(1) != Some('=') {
            self.p.consume_char('!');
            return Ok(Condition::Not(Box::new(self.parse_unary()?)));
        }
        if self.p.peek_char() == Some('(') {
            let mark = self.p.mark();
            self.p.consume_char('(');
            if let Ok(grouped) = self.parse_condition() {
                self.p.skip_ws();
                if self.p.consume_char(')') {
                    self.p.skip_ws();
                    let follow = self.p.mark();
                    if self.parse_operator().is_none() {
                        return Ok(grouped);
                    }
                    self.p.reset(follow);
                }
            }
            // A parenthesised expression on the left of an operator.
            self.p.reset(mark);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Condition> {
        let left = self.parse_expression(true)?;
        self.p.skip_ws();
        let Some(operator) = self.parse_operator() else {
            return Ok(Condition::Truthy(left));
        };
        let right = if operator == "exists" || operator == "notexists" {
            None
        } else {
            Some(self.parse_expression(true)?)
        };
        Ok(Condition::Compare {
            left,
            operator,
            right,
        })
    }

    fn parse_operator(&mut self) -> Option<String> {
        for symbol in SYMBOL_OPERATORS {
            if self.p.consume_str(symbol) {
                return Some(symbol.to_string());
            }
        }
        let mark = self.p.mark();
        let negated = self.p.peek_char() == Some('!')
            && self.p.peek_nth(1).is_some_and(|c| c.is_ascii_alphabetic());
        if negated {
            self.p.consume_char('!');
        }
        if !self.p.peek_char().is_some_and(|c| c.is_ascii_alphabetic()) {
            self.p.reset(mark);
            return None;
        }
        match self.p.parse_identifier() {
            Ok(word) if !matches!(word.to_lowercase().as_str(), "and" | "or") => {
                let word = word.to_lowercase();
                Some(if negated { format!("!{word}") } else { word })
            }
            _ => {
                self.p.reset(mark);
                None
            }
        }
    }

    /// `block_calls` allows `@.Service.Method(...) { block }` statement calls.
    fn parse_expression(&mut self, block_calls: bool) -> Result<CommandRef> {
        let mut expression = self.parse_primary(block_calls)?;
        loop {
            self.p.skip_ws();
            if self.p.peek_char() == Some('|') && self.p.peek_nth(1) != Some('|') {
                self.p.consume_char('|');
                self.p.skip_ws();
                let position = self.p.position();
                let name = self.parse_dotted_name()?;
                self.p.skip_ws();
                let arguments = if self.p.peek_char() == Some('(') {
                    self.parse_arguments()?
                } else {
                    Vec::new()
                };
                expression = Arc::new(ModifierCall {
                    input: expression,
                    name,
                    arguments,
                    position: Some(position),
                });
            } else {
                break;
            }
        }
        Ok(expression)
    }

    fn parse_dotted_name(&mut self) -> Result<String> {
        let mut name = self.p.parse_identifier()?;
        while self.p.peek_char() == Some('.') && self.p.peek_nth(1).is_some_and(|c| c.is_ascii_alphabetic()) {
            self.p.consume_char('.');
            name.push('.');
            name.push_str(&self.p.parse_identifier()?);
        }
        Ok(name)
    }

    fn parse_primary(&mut self, block_calls: bool) -> Result<CommandRef> {
        self.p.skip_ws();
        match self.p.peek_char() {
            Some('\'') | Some('"') => Ok(literal(Value::String(self.p.parse_quoted_string()?))),
            Some(c) if c == '-' || c.is_ascii_digit() => Ok(literal(self.p.parse_number_literal()?)),
            Some('{') => self.parse_object(),
            Some('[') => self.parse_array(),
            Some('$') => {
                let name = self.p.parse_variable()?;
                let path = self.parse_path()?;
                Ok(Arc::new(VariableSelector { name, path }))
            }
            Some('@') => self.parse_call(block_calls),
            Some('(') => {
                self.p.consume_char('(');
                let inner = self.parse_expression(true)?;
                self.p.expect(')')?;
                Ok(inner)
            }
            Some(c) if c.is_ascii_alphabetic() => {
                if let Some(looped) = self.parse_loop()? {
                    return Ok(looped);
                }
                let word = self.p.parse_identifier()?;
                match word.as_str() {
                    "true" => Ok(literal(Value::Bool(true))),
                    "false" => Ok(literal(Value::Bool(false))),
                    "null" => Ok(literal(Value::Null)),
                    other => Err(self.p.error(format!("unexpected '{other}'"))),
                }
            }
            Some(c) => Err(self.p.error(format!("unexpected '{c}'"))),
            None => Err(self.p.error("unexpected end of input")),
        }
    }

    fn parse_path(&mut self) -> Result<Vec<PathSegment>> {
        let mut path = Vec::new();
        loop {
            if self.p.peek_char() == Some('.')
                && self.p.peek_nth(1).is_some_and(|c| c == '_' || c.is_ascii_alphanumeric())
            {
                self.p.consume_char('.');
                path.push(PathSegment::Key(self.p.parse_identifier()?));
            } else if self.p.peek_char() == Some('[') {
                self.p.consume_char('[');
                self.p.skip_ws();
                match self.p.peek_char() {
                    Some('\'') | Some('"') => path.push(PathSegment::Key(self.p.parse_quoted_string()?)),
                    _ => match self.p.parse_number_literal()?.as_u64() {
                        Some(i) => path.push(PathSegment::Index(i as usize)),
                        None => return Err(self.p.error("array index must be a non-negative integer")),
                    },
                }
                self.p.expect(']')?;
            } else {
                break;
            }
        }
        Ok(path)
    }

    fn parse_object(&mut self) -> Result<CommandRef> {
        self.p.expect('{')?;
        let mut entries = Vec::new();
        loop {
            self.p.skip_ws();
            if self.p.consume_char('}') {
                break;
            }
            let key = match self.p.peek_char() {
                Some('\'') | Some('"') => self.p.parse_quoted_string()?,
                _ => self.p.parse_identifier()?,
            };
            self.p.expect(':')?;
            entries.push((key, self.parse_expression(true)?));
            self.p.skip_ws();
            if !self.p.consume_char(',') && !self.p.consume_char(';') {
                self.p.expect('}')?;
                break;
            }
        }
        Ok(Arc::new(ObjectBuild(entries)))
    }

    fn parse_array(&mut self) -> Result<CommandRef> {
        self.p.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.p.skip_ws();
            if self.p.consume_char(']') {
                break;
            }
            items.push(self.parse_expression(true)?);
            self.p.skip_ws();
            if !self.p.consume_char(',') {
                self.p.expect(']')?;
                break;
            }
        }
        Ok(Arc::new(ArrayBuild(items)))
    }

    fn parse_arguments(&mut self) -> Result<Vec<CommandRef>> {
        self.p.expect('(')?;
        let mut arguments = Vec::new();
        loop {
            self.p.skip_ws();
            if self.p.consume_char(')') {
                break;
            }
            arguments.push(self.parse_expression(true)?);
            self.p.skip_ws();
            if !self.p.consume_char(',') {
                self.p.expect(')')?;
                break;
            }
        }
        Ok(arguments)
    }

    fn parse_call(&mut self, block_calls: bool) -> Result<CommandRef> {
        let position = self.p.position();
        self.p.consume_char('@');
        if !self.p.consume_char('.') {
            return Err(self.p.error("expected '@.' call"));
        }
        let service = self.p.parse_identifier()?;
        self.p.expect('.')?;
        let method = self.p.parse_identifier()?;
        self.p.skip_ws();
        let arguments = self.parse_arguments()?;

        let service_key = service.to_lowercase();
        if service_key == "this" {
            return Ok(Arc::new(Call {
                name: format!("this.{method}"),
                arguments,
                position: Some(position),
            }));
        }
        if let Some(module) = self.imports.get(&service_key) {
            if module.function(&method).is_none() {
                return Err(IslError::Parse {
                    message: format!(
                        "Module {} Could not find {method} in imported module {}",
                        self.module,
                        module.name()
                    ),
                    position,
                });
            }
            return Ok(Arc::new(ModuleCall {
                module: module.clone(),
                function: method,
                arguments,
                position: Some(position),
            }));
        }

        let name = format!("{service}.{method}");
        self.p.skip_ws();
        if block_calls && self.p.peek_char() == Some('{') {
            let block = self.parse_block()?;
            return Ok(Arc::new(StatementCall {
                name,
                arguments,
                block,
                position: Some(position),
            }));
        }
        Ok(Arc::new(Call {
            name,
            arguments,
            position: Some(position),
        }))
    }
}
