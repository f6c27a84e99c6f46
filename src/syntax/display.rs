//! Textual rendering of statements
//!
//! Output is deterministic and is what plan representations and explain
//! output compare against.

use std::fmt;

use super::nodes::{
    Constant, Delete, Insert, MainEntity, MainRelation, Node, NodeId, Operand, Optional, Relation,
    Select, Statement, Union, Update,
};

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(i) => write!(f, "{}", i),
            Constant::String(s) => {
                write!(f, "{}", serde_json::Value::String(s.clone()))
            }
            Constant::Boolean(true) => write!(f, "TRUE"),
            Constant::Boolean(false) => write!(f, "FALSE"),
            Constant::Null => write!(f, "NULL"),
            Constant::Substitute(key) => write!(f, "%({})s", key),
            Constant::Etype(name) => write!(f, "{}", name),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(name) => write!(f, "{}", name),
            Operand::Const(c) => write!(f, "{}", c),
            Operand::Func(name, args) => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lhs)?;
        if self.optional == Optional::Left {
            write!(f, "?")?;
        }
        write!(f, " {} ", self.rtype)?;
        if self.op != super::nodes::CmpOp::Eq {
            write!(f, "{} ", self.op.as_str())?;
        }
        write!(f, "{}", self.rhs)?;
        if self.optional == Optional::Right {
            write!(f, "?")?;
        }
        Ok(())
    }
}

/// Renders the restriction subtree rooted at `id`
pub fn render_node(select: &Select, id: NodeId) -> String {
    match select.node(id) {
        Node::Relation(rel) => rel.to_string(),
        Node::And(children) => children
            .iter()
            .map(|c| render_node(select, *c))
            .collect::<Vec<_>>()
            .join(", "),
        Node::Or(children) => children
            .iter()
            .map(|c| format!("({})", render_node(select, *c)))
            .collect::<Vec<_>>()
            .join(" OR "),
        Node::Not(child) => match select.node(*child) {
            Node::Relation(_) => format!("NOT {}", render_node(select, *child)),
            _ => format!("NOT ({})", render_node(select, *child)),
        },
        Node::Exists(child) => format!("EXISTS({})", render_node(select, *child)),
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        write!(f, "Any")?;
        if !self.selection.is_empty() {
            write!(f, " {}", join(&self.selection))?;
        }
        if !self.groupby.is_empty() {
            write!(f, " GROUPBY {}", self.groupby.join(","))?;
        }
        if !self.orderby.is_empty() {
            let terms: Vec<String> = self
                .orderby
                .iter()
                .map(|t| {
                    if t.asc {
                        t.term.to_string()
                    } else {
                        format!("{} DESC", t.term)
                    }
                })
                .collect();
            write!(f, " ORDERBY {}", terms.join(","))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        if self.offset > 0 {
            write!(f, " OFFSET {}", self.offset)?;
        }
        if let Some(root) = self.restriction {
            let text = render_node(self, root);
            if !text.is_empty() {
                write!(f, " WHERE {}", text)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Union {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.children.len() == 1 {
            return write!(f, "{}", self.children[0]);
        }
        let parts: Vec<String> = self.children.iter().map(|c| format!("({})", c)).collect();
        write!(f, "{}", parts.join(" UNION "))
    }
}

impl fmt::Display for MainRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.rtype, self.rhs)
    }
}

impl fmt::Display for MainEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.etype, self.var)
    }
}

fn write_where(f: &mut fmt::Formatter<'_>, select: &Select) -> fmt::Result {
    if let Some(root) = select.restriction {
        write!(f, " WHERE {}", render_node(select, root))?;
    }
    Ok(())
}

impl fmt::Display for Insert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT {}", join(&self.entities))?;
        if !self.relations.is_empty() {
            write!(f, ": {}", join(&self.relations))?;
        }
        if let Some(select) = &self.select {
            write_where(f, select)?;
        }
        Ok(())
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SET {}", join(&self.relations))?;
        write_where(f, &self.select)
    }
}

impl fmt::Display for Delete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.entities.iter().map(|e| e.to_string()).collect();
        parts.extend(self.relations.iter().map(|r| r.to_string()));
        write!(f, "DELETE {}", parts.join(","))?;
        write_where(f, &self.select)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(union) => write!(f, "{}", union),
            Statement::Insert(insert) => write!(f, "{}", insert),
            Statement::Update(update) => write!(f, "{}", update),
            Statement::Delete(delete) => write!(f, "{}", delete),
        }
    }
}
