use std::fmt::Write;
use std::rc::Rc;

use crate::expr::{
    CallList, Cpp, Filter, Identifier, Literal, Name, Operand, OutputMode, ParamList, StringLit,
    Variable,
};
use crate::source::Position;

/// Handle into the AST arena. Parent links and children collections store
/// handles, never owning references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Errors produced by tree operations. `Cast` is a structural placement
/// failure (the parser decorates it with the open-node stack); `Message` is
/// reported as a plain parse error at the current position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AstError {
    Cast(String),
    Message(String),
}

fn cast_message(actual: &str, expected: &str) -> AstError {
    AstError::Cast(format!(
        "could not insert child node: parent node is {actual}, but it should be {expected}"
    ))
}

/// A C++ block at root scope.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeBlock {
    pub pos: Position,
    pub code: Cpp,
}

/// A named skin: the unit of runtime registration, holding views in
/// declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Skin {
    pub name: Name,
    pub pos: Position,
    pub endpos: Position,
    pub views: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct Root {
    pub codes: Vec<CodeBlock>,
    pub skins: Vec<Skin>,
    pub current_skin: Option<usize>,
    pub mode: Option<OutputMode>,
    pub mode_pos: Option<Position>,
}

#[derive(Debug)]
pub struct View {
    pub name: Name,
    pub data: Identifier,
    pub master: Option<Name>,
    pub endpos: Position,
    pub templates: Vec<NodeId>,
}

#[derive(Debug)]
pub struct Template {
    pub name: Name,
    pub template_args: Vec<Identifier>,
    pub params: ParamList,
    pub endpos: Position,
    pub children: Vec<NodeId>,
}

#[derive(Debug)]
pub struct CppCode {
    pub code: Cpp,
}

#[derive(Debug)]
pub struct TextNode {
    pub value: Literal,
}

#[derive(Debug)]
pub struct VariableEmit {
    pub variable: Variable,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmtVerb {
    Gt,
    Url,
    Format,
    Rformat,
}

impl FmtVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Url => "url",
            Self::Format => "format",
            Self::Rformat => "rformat",
        }
    }
}

/// One argument after a `using` keyword: a variable plus its filter chain.
#[derive(Debug, Clone, PartialEq)]
pub struct UsingOption {
    pub variable: Variable,
    pub filters: Vec<Filter>,
    pub pos: Position,
}

#[derive(Debug)]
pub struct FmtFunction {
    pub verb: FmtVerb,
    pub fmt: StringLit,
    pub options: Vec<UsingOption>,
}

#[derive(Debug)]
pub struct Ngt {
    pub singular: StringLit,
    pub plural: StringLit,
    pub variable: Variable,
    pub options: Vec<UsingOption>,
}

#[derive(Debug)]
pub struct Include {
    pub call: CallList,
    pub from: Option<Identifier>,
    pub using_view: Option<Identifier>,
    pub with: Option<Variable>,
}

#[derive(Debug)]
pub struct Form {
    pub style: Name,
    pub variable: Variable,
    pub endpos: Position,
    pub children: Vec<NodeId>,
}

impl Form {
    pub fn is_block_style(style: &Name) -> bool {
        style.repr() == "block" || style.repr() == "begin"
    }
}

#[derive(Debug)]
pub struct Csrf {
    pub style: Option<Name>,
}

#[derive(Debug)]
pub struct Render {
    pub skin: Option<Operand>,
    pub view: Operand,
    pub with: Option<Variable>,
}

#[derive(Debug)]
pub struct Using {
    pub id: Identifier,
    pub with: Option<Variable>,
    pub as_id: Identifier,
    pub endpos: Position,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct IfNode {
    pub conditions: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondKind {
    Regular,
    Empty,
    Rtl,
    Cpp,
    Else,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOp {
    And,
    Or,
}

/// A further `and`/`or` clause chained onto a condition.
#[derive(Debug)]
pub struct CondChain {
    pub op: ChainOp,
    pub kind: CondKind,
    pub negate: bool,
    pub variable: Option<Variable>,
}

#[derive(Debug)]
pub struct Condition {
    pub kind: CondKind,
    pub negate: bool,
    pub variable: Option<Variable>,
    pub cpp: Option<Cpp>,
    pub chain: Vec<CondChain>,
    pub endpos: Position,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartRole {
    Prefix,
    Item,
    Suffix,
    Separator,
    Empty,
}

impl PartRole {
    fn sysname(self) -> &'static str {
        match self {
            Self::Prefix => "item_prefix",
            Self::Item => "item",
            Self::Suffix => "item_suffix",
            Self::Separator => "item_separator",
            Self::Empty => "item_empty",
        }
    }
}

#[derive(Debug)]
pub struct ForeachPart {
    pub role: PartRole,
    pub endpos: Position,
    pub children: Vec<NodeId>,
}

#[derive(Debug)]
pub struct Foreach {
    pub item: Name,
    pub as_id: Option<Identifier>,
    pub rowid: Option<Name>,
    pub from: i64,
    pub array: Variable,
    pub reverse: bool,
    pub prefix: Option<NodeId>,
    pub item_part: Option<NodeId>,
    pub suffix: Option<NodeId>,
    pub separator: Option<NodeId>,
    pub empty: Option<NodeId>,
}

#[derive(Debug)]
pub struct Cache {
    pub key: Operand,
    pub miss: Option<Variable>,
    pub duration: i64,
    pub recording: bool,
    pub triggers: bool,
    pub trigger_list: Vec<(Position, Operand)>,
    pub endpos: Position,
    pub children: Vec<NodeId>,
}

#[derive(Debug)]
pub enum NodeKind {
    Root(Root),
    View(View),
    Template(Template),
    CppCode(CppCode),
    Text(TextNode),
    VariableEmit(VariableEmit),
    FmtFunction(FmtFunction),
    Ngt(Ngt),
    Include(Include),
    Form(Form),
    Csrf(Csrf),
    Render(Render),
    Using(Using),
    If(IfNode),
    Condition(Condition),
    Foreach(Foreach),
    ForeachPart(ForeachPart),
    Cache(Cache),
}

#[derive(Debug)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub block: bool,
    pub pos: Position,
    pub kind: NodeKind,
}

/// The directive tree, stored as an arena of nodes addressed by handle. Node
/// 0 is the root. The tree is immutable after parsing.
#[derive(Debug)]
pub struct Ast {
    nodes: Vec<Node>,
}

pub const ROOT: NodeId = NodeId(0);

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

impl Ast {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                block: true,
                pos: Position {
                    file: Rc::from("__root__"),
                    line: 0,
                },
                kind: NodeKind::Root(Root::default()),
            }],
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn root(&self) -> &Root {
        match &self.nodes[ROOT.0].kind {
            NodeKind::Root(root) => root,
            _ => unreachable!("bug: node 0 is not the root"),
        }
    }

    fn root_mut(&mut self) -> &mut Root {
        match &mut self.nodes[ROOT.0].kind {
            NodeKind::Root(root) => root,
            _ => unreachable!("bug: node 0 is not the root"),
        }
    }

    pub fn mode(&self) -> Option<OutputMode> {
        self.root().mode
    }

    /// The node's system name, used for `end [NAME]` matching and
    /// diagnostics.
    pub fn sysname(&self, id: NodeId) -> &'static str {
        match &self.nodes[id.0].kind {
            NodeKind::Root(_) => "root",
            NodeKind::View(_) => "view",
            NodeKind::Template(_) => "template",
            NodeKind::CppCode(_) => "c++",
            NodeKind::Text(_) => "text",
            NodeKind::VariableEmit(_) => "variable",
            NodeKind::FmtFunction(f) => f.verb.as_str(),
            NodeKind::Ngt(_) => "ngt",
            NodeKind::Include(_) => "include",
            NodeKind::Form(_) => "form",
            NodeKind::Csrf(_) => "csrf",
            NodeKind::Render(_) => "render",
            NodeKind::Using(_) => "using",
            NodeKind::If(_) => "if",
            NodeKind::Condition(_) => "condition",
            NodeKind::Foreach(_) => "foreach",
            NodeKind::ForeachPart(p) => p.role.sysname(),
            NodeKind::Cache(_) => "cache",
        }
    }

    /// The user-visible name used in placement diagnostics.
    pub fn user_name(&self, id: NodeId) -> &'static str {
        match &self.nodes[id.0].kind {
            NodeKind::Root(_) => "skin",
            NodeKind::View(_) => "view",
            NodeKind::Template(_) => "template",
            NodeKind::CppCode(_) => "c++",
            NodeKind::Text(_) => "text",
            NodeKind::VariableEmit(_) => "variable",
            NodeKind::FmtFunction(_) => "(format function, like gt, url, ...)",
            NodeKind::Ngt(_) => "ngt",
            NodeKind::Include(_) => "include",
            NodeKind::Form(_) => "form",
            NodeKind::Csrf(_) => "csrf",
            NodeKind::Render(_) => "render",
            NodeKind::Using(_) => "using",
            NodeKind::If(_) => "if",
            NodeKind::Condition(_) => "if",
            NodeKind::Foreach(_) => "foreach",
            NodeKind::ForeachPart(_) => "foreach child (item, separator, empty, prefix, suffix)",
            NodeKind::Cache(_) => "cache",
        }
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        matches!(self.nodes[id.0].kind, NodeKind::Root(_))
    }

    pub fn is_condition(&self, id: NodeId) -> bool {
        matches!(self.nodes[id.0].kind, NodeKind::Condition(_))
    }

    fn children_slot(&mut self, id: NodeId) -> Option<&mut Vec<NodeId>> {
        match &mut self.nodes[id.0].kind {
            NodeKind::Template(n) => Some(&mut n.children),
            NodeKind::Form(n) => Some(&mut n.children),
            NodeKind::Using(n) => Some(&mut n.children),
            NodeKind::Condition(n) => Some(&mut n.children),
            NodeKind::ForeachPart(n) => Some(&mut n.children),
            NodeKind::Cache(n) => Some(&mut n.children),
            _ => None,
        }
    }

    /// Whether `id` accepts ordinary statement children.
    pub fn accepts_children(&self, id: NodeId) -> bool {
        matches!(
            self.nodes[id.0].kind,
            NodeKind::Template(_)
                | NodeKind::Form(_)
                | NodeKind::Using(_)
                | NodeKind::Condition(_)
                | NodeKind::ForeachPart(_)
                | NodeKind::Cache(_)
        )
    }

    /// Appends a node under `parent` and returns the new current node: the
    /// child if it opens a block, otherwise `parent` itself.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        pos: Position,
        block: bool,
        kind: NodeKind,
    ) -> Result<NodeId, AstError> {
        if !self.accepts_children(parent) {
            return Err(cast_message(
                self.user_name(parent),
                "(any block node, like template, if, foreach, ...)",
            ));
        }
        let id = self.alloc(Node {
            parent: Some(parent),
            block,
            pos,
            kind,
        });
        self.children_slot(parent)
            .expect("bug: children slot missing")
            .push(id);
        Ok(if block { id } else { parent })
    }

    /// Opens (or reopens) a skin. The current node must be the root.
    pub fn add_skin(
        &mut self,
        current: NodeId,
        name: Name,
        pos: Position,
    ) -> Result<NodeId, AstError> {
        if !self.is_root(current) {
            return Err(cast_message(self.user_name(current), "skin"));
        }
        let root = self.root_mut();
        match root.skins.iter().position(|s| s.name.repr() == name.repr()) {
            Some(i) => root.current_skin = Some(i),
            None => {
                root.skins.push(Skin {
                    name,
                    pos: pos.clone(),
                    endpos: pos,
                    views: Vec::new(),
                });
                root.current_skin = Some(root.skins.len() - 1);
            }
        }
        Ok(current)
    }

    /// Declares (or reopens) a view inside the current skin.
    pub fn add_view(
        &mut self,
        current: NodeId,
        name: Name,
        pos: Position,
        data: Identifier,
        master: Option<Name>,
    ) -> Result<NodeId, AstError> {
        if !self.is_root(current) {
            return Err(cast_message(self.user_name(current), "skin"));
        }
        let Some(skin) = self.root().current_skin else {
            return Err(AstError::Message("view must be inside skin".to_string()));
        };
        let existing = self.root().skins[skin]
            .views
            .iter()
            .find(|&&id| match &self.nodes[id.0].kind {
                NodeKind::View(v) => v.name.repr() == name.repr(),
                _ => false,
            })
            .copied();
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = self.alloc(Node {
            parent: Some(current),
            block: true,
            pos: pos.clone(),
            kind: NodeKind::View(View {
                name,
                data,
                master,
                endpos: pos,
                templates: Vec::new(),
            }),
        });
        self.root_mut().skins[skin].views.push(id);
        Ok(id)
    }

    pub fn set_mode(
        &mut self,
        current: NodeId,
        mode: OutputMode,
        pos: Position,
    ) -> Result<NodeId, AstError> {
        if !self.is_root(current) {
            return Err(cast_message(self.user_name(current), "skin"));
        }
        let root = self.root_mut();
        root.mode = Some(mode);
        root.mode_pos = Some(pos);
        Ok(current)
    }

    pub fn add_root_cpp(&mut self, code: Cpp, pos: Position) {
        self.root_mut().codes.push(CodeBlock { pos, code });
    }

    /// Declares a template (member function) on the current view.
    pub fn add_template(
        &mut self,
        current: NodeId,
        name: Name,
        pos: Position,
        template_args: Vec<Identifier>,
        params: ParamList,
    ) -> Result<NodeId, AstError> {
        if !matches!(self.nodes[current.0].kind, NodeKind::View(_)) {
            return Err(cast_message(self.user_name(current), "view"));
        }
        let id = self.alloc(Node {
            parent: Some(current),
            block: true,
            pos: pos.clone(),
            kind: NodeKind::Template(Template {
                name,
                template_args,
                params,
                endpos: pos,
                children: Vec::new(),
            }),
        });
        match &mut self.nodes[current.0].kind {
            NodeKind::View(v) => v.templates.push(id),
            _ => unreachable!(),
        }
        Ok(id)
    }

    /// Appends a condition to an open `if`, closing the previous condition.
    pub fn add_condition(
        &mut self,
        current: NodeId,
        pos: Position,
        kind: CondKind,
        variable: Option<Variable>,
        cpp: Option<Cpp>,
        negate: bool,
    ) -> Result<NodeId, AstError> {
        if !matches!(self.nodes[current.0].kind, NodeKind::If(_)) {
            return Err(cast_message(self.user_name(current), "if"));
        }
        let last = match &self.nodes[current.0].kind {
            NodeKind::If(i) => i.conditions.last().copied(),
            _ => unreachable!(),
        };
        if let Some(last) = last {
            if let NodeKind::Condition(c) = &mut self.nodes[last.0].kind {
                c.endpos = pos.clone();
            }
        }
        let id = self.alloc(Node {
            parent: Some(current),
            block: true,
            pos: pos.clone(),
            kind: NodeKind::Condition(Condition {
                kind,
                negate,
                variable,
                cpp,
                chain: Vec::new(),
                endpos: pos,
                children: Vec::new(),
            }),
        });
        match &mut self.nodes[current.0].kind {
            NodeKind::If(i) => i.conditions.push(id),
            _ => unreachable!(),
        }
        Ok(id)
    }

    /// Chains an `and`/`or` clause onto the current condition.
    pub fn add_condition_chain(
        &mut self,
        current: NodeId,
        link: CondChain,
    ) -> Result<(), AstError> {
        if !self.is_condition(current) {
            return Err(cast_message(self.user_name(current), "if"));
        }
        match &mut self.nodes[current.0].kind {
            NodeKind::Condition(c) => c.chain.push(link),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// The foreach node owning `current`, for `item`/`empty`/`separator`.
    pub fn enclosing_foreach(&self, current: NodeId) -> Result<NodeId, AstError> {
        let parent = self.nodes[current.0].parent;
        match parent {
            Some(p) if matches!(self.nodes[p.0].kind, NodeKind::Foreach(_)) => Ok(p),
            Some(p) => Err(cast_message(self.user_name(p), "foreach")),
            None => Err(cast_message("skin", "foreach")),
        }
    }

    /// Fetches or creates one of a foreach's five parts.
    pub fn foreach_part(&mut self, foreach: NodeId, role: PartRole, pos: Position) -> NodeId {
        let existing = match &self.nodes[foreach.0].kind {
            NodeKind::Foreach(f) => match role {
                PartRole::Prefix => f.prefix,
                PartRole::Item => f.item_part,
                PartRole::Suffix => f.suffix,
                PartRole::Separator => f.separator,
                PartRole::Empty => f.empty,
            },
            _ => panic!("bug: foreach_part on non-foreach node"),
        };
        if let Some(id) = existing {
            return id;
        }
        let id = self.alloc(Node {
            parent: Some(foreach),
            block: true,
            pos: pos.clone(),
            kind: NodeKind::ForeachPart(ForeachPart {
                role,
                endpos: pos,
                children: Vec::new(),
            }),
        });
        match &mut self.nodes[foreach.0].kind {
            NodeKind::Foreach(f) => match role {
                PartRole::Prefix => f.prefix = Some(id),
                PartRole::Item => f.item_part = Some(id),
                PartRole::Suffix => f.suffix = Some(id),
                PartRole::Separator => f.separator = Some(id),
                PartRole::Empty => f.empty = Some(id),
            },
            _ => unreachable!(),
        }
        id
    }

    /// Appends a trigger to an open cache block.
    pub fn add_cache_trigger(
        &mut self,
        current: NodeId,
        pos: Position,
        key: Operand,
    ) -> Result<NodeId, AstError> {
        if !matches!(self.nodes[current.0].kind, NodeKind::Cache(_)) {
            return Err(cast_message(self.user_name(current), "cache"));
        }
        match &mut self.nodes[current.0].kind {
            NodeKind::Cache(c) => c.trigger_list.push((pos, key)),
            _ => unreachable!(),
        }
        Ok(current)
    }

    fn set_endpos(&mut self, id: NodeId, pos: Position) {
        match &mut self.nodes[id.0].kind {
            NodeKind::View(n) => n.endpos = pos,
            NodeKind::Template(n) => n.endpos = pos,
            NodeKind::Using(n) => n.endpos = pos,
            NodeKind::Cache(n) => n.endpos = pos,
            NodeKind::Form(n) => n.endpos = pos,
            NodeKind::Condition(n) => n.endpos = pos,
            NodeKind::ForeachPart(n) => n.endpos = pos,
            _ => {}
        }
    }

    fn end_simple(
        &mut self,
        current: NodeId,
        parent: Option<NodeId>,
        what: &str,
        sysname: &str,
        pos: Position,
    ) -> Result<NodeId, AstError> {
        if what.is_empty() || what == sysname {
            self.set_endpos(current, pos);
            Ok(parent.expect("bug: block node without parent"))
        } else {
            Err(AstError::Message(format!(
                "expected 'end {sysname}', not 'end {what}'"
            )))
        }
    }

    /// Handles `end [NAME]` on the current node: validates the name and
    /// returns the node that becomes the new current.
    pub fn end(&mut self, current: NodeId, what: &str, pos: Position) -> Result<NodeId, AstError> {
        enum Tag {
            Root(Option<usize>),
            Simple(&'static str),
            Form(bool),
            Condition,
            Part(PartRole),
            Inline,
        }
        let parent = self.nodes[current.0].parent;
        let tag = match &self.nodes[current.0].kind {
            NodeKind::Root(root) => Tag::Root(root.current_skin),
            NodeKind::View(_) => Tag::Simple("view"),
            NodeKind::Template(_) => Tag::Simple("template"),
            NodeKind::Using(_) => Tag::Simple("using"),
            NodeKind::Cache(_) => Tag::Simple("cache"),
            NodeKind::Form(form) => Tag::Form(Form::is_block_style(&form.style)),
            NodeKind::Condition(_) => Tag::Condition,
            NodeKind::ForeachPart(part) => Tag::Part(part.role),
            _ => Tag::Inline,
        };

        match tag {
            Tag::Root(open_skin) => {
                if let Some(skin) = open_skin {
                    if what.is_empty() || what == "skin" {
                        let root = self.root_mut();
                        root.skins[skin].endpos = pos;
                        root.current_skin = None;
                        Ok(current)
                    } else {
                        Err(AstError::Message(format!(
                            "expected 'end skin', not 'end {what}'"
                        )))
                    }
                } else {
                    Err(AstError::Message(format!("unexpected 'end {what}'")))
                }
            }
            Tag::Simple(sysname) => self.end_simple(current, parent, what, sysname, pos),
            Tag::Form(block) => {
                if !block {
                    panic!("bug: end in non-block component");
                }
                if what.is_empty() || what == "form" {
                    self.set_endpos(current, pos);
                    Ok(parent.expect("bug: form without parent"))
                } else {
                    Err(AstError::Message(format!(
                        "Unexpected 'end {what}', expected 'end form'"
                    )))
                }
            }
            Tag::Condition => {
                if what.is_empty() || what == "if" {
                    self.set_endpos(current, pos);
                    // condition -> if -> the if's parent
                    let if_node = parent.expect("bug: condition without parent");
                    Ok(self.nodes[if_node.0]
                        .parent
                        .expect("bug: if without parent"))
                } else {
                    let started = self.nodes[current.0].pos.clone();
                    Err(AstError::Message(format!(
                        "expected 'end if', not 'end {what}', if started at line {started}"
                    )))
                }
            }
            Tag::Part(role) => {
                let foreach = parent.expect("bug: foreach part without parent");
                if role == PartRole::Item {
                    if what.is_empty() || what == "item" {
                        self.set_endpos(current, pos.clone());
                        Ok(self.foreach_part(foreach, PartRole::Suffix, pos))
                    } else {
                        Err(AstError::Message(format!(
                            "expected 'end item', not 'end {what}'"
                        )))
                    }
                } else if what.is_empty() || what == "foreach" {
                    if role == PartRole::Prefix {
                        Err(AstError::Message("foreach without <% item %>".to_string()))
                    } else {
                        self.set_endpos(current, pos);
                        Ok(self.nodes[foreach.0]
                            .parent
                            .expect("bug: foreach without parent"))
                    }
                } else {
                    Err(AstError::Message(format!(
                        "expected 'end foreach', not 'end {what}'"
                    )))
                }
            }
            Tag::Inline => panic!("bug: end in non-block component"),
        }
    }

    /// Renders the tree in the `--ast` format.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_root(&mut out);
        out
    }

    fn tabs(depth: usize) -> String {
        "\t".repeat(depth)
    }

    fn dump_root(&self, o: &mut String) {
        let root = self.root();
        let mode = root
            .mode
            .map(OutputMode::as_str)
            .unwrap_or("(default)");
        let _ = writeln!(
            o,
            "root with {} codes, mode = {} [",
            root.codes.len(),
            mode
        );
        for skin in &root.skins {
            let _ = writeln!(
                o,
                "\tskin {} with {} views [",
                skin.name,
                skin.views.len()
            );
            for &view in &skin.views {
                self.dump_node(view, o, 2);
            }
            let _ = writeln!(o, "\t]");
        }
        let _ = writeln!(o, "]; codes = [");
        for code in &root.codes {
            let _ = writeln!(o, "\t{}", code.code);
        }
        let _ = writeln!(o, "];");
    }

    fn dump_children(&self, children: &[NodeId], o: &mut String, depth: usize) {
        for &child in children {
            self.dump_node(child, o, depth);
        }
    }

    fn dump_using_options(&self, options: &[UsingOption], o: &mut String, depth: usize) {
        let p = Self::tabs(depth);
        if options.is_empty() {
            let _ = writeln!(o, "{p}\twithout using");
        } else {
            let _ = writeln!(o, "{p}\twith using options:");
            for uo in options {
                self.dump_variable_with_filters(&uo.variable, &uo.filters, o, depth + 2);
            }
        }
    }

    fn dump_variable_with_filters(
        &self,
        variable: &Variable,
        filters: &[Filter],
        o: &mut String,
        depth: usize,
    ) {
        let p = Self::tabs(depth);
        let _ = write!(o, "{p}variable: {variable}");
        if filters.is_empty() {
            let _ = writeln!(o, " without filters");
        } else {
            let _ = write!(o, " with filters: ");
            for filter in filters {
                let _ = write!(o, " | {filter}");
            }
            let _ = writeln!(o);
        }
    }

    fn dump_node(&self, id: NodeId, o: &mut String, depth: usize) {
        let p = Self::tabs(depth);
        match &self.nodes[id.0].kind {
            NodeKind::Root(_) => self.dump_root(o),
            NodeKind::View(view) => {
                let _ = write!(o, "{p}view {} uses {} extends ", view.name, view.data);
                match &view.master {
                    Some(master) => {
                        let _ = write!(o, "{master}");
                    }
                    None => {
                        let _ = write!(o, "(default)");
                    }
                }
                let _ = writeln!(o, " with {} templates {{", view.templates.len());
                self.dump_children(&view.templates, o, depth + 1);
                let _ = writeln!(o, "{p}}}");
            }
            NodeKind::Template(t) => {
                let _ = writeln!(
                    o,
                    "{p}template {} with arguments {} and {} children [",
                    t.name,
                    t.params,
                    t.children.len()
                );
                self.dump_children(&t.children, o, depth + 1);
                let _ = writeln!(o, "{p}]");
            }
            NodeKind::CppCode(c) => {
                let _ = writeln!(o, "{p}c++: {}", c.code);
            }
            NodeKind::Text(t) => {
                let _ = writeln!(o, "{p}text: {}", t.value);
            }
            NodeKind::VariableEmit(v) => {
                self.dump_variable_with_filters(&v.variable, &v.filters, o, depth);
            }
            NodeKind::FmtFunction(f) => {
                let _ = writeln!(o, "{p}fmt function {}: {}", f.verb.as_str(), f.fmt.repr());
                self.dump_using_options(&f.options, o, depth);
            }
            NodeKind::Ngt(n) => {
                let _ = writeln!(
                    o,
                    "{p}fmt function ngt: {}/{} with variable {}",
                    n.singular, n.plural, n.variable
                );
                self.dump_using_options(&n.options, o, depth);
            }
            NodeKind::Include(inc) => {
                let _ = write!(o, "{p}include {}", inc.call);
                match (&inc.from, &inc.using_view) {
                    (Some(from), _) => {
                        let _ = write!(o, " from {from}");
                    }
                    (None, Some(using_view)) => {
                        let _ = write!(o, " using {using_view}");
                        match &inc.with {
                            Some(with) => {
                                let _ = write!(o, " with {with}");
                            }
                            None => {
                                let _ = write!(o, " with (this content)");
                            }
                        }
                    }
                    (None, None) => {
                        let _ = write!(o, " from (self)");
                    }
                }
                let _ = writeln!(o);
            }
            NodeKind::Form(form) => {
                let _ = writeln!(
                    o,
                    "{p}form style = {} using variable {}",
                    form.style, form.variable
                );
            }
            NodeKind::Csrf(csrf) => match &csrf.style {
                Some(style) => {
                    let _ = writeln!(o, "{p}csrf style = {style}");
                }
                None => {
                    let _ = writeln!(o, "{p}csrf style = (default)");
                }
            },
            NodeKind::Render(render) => {
                let _ = write!(o, "{p}render skin = ");
                match &render.skin {
                    Some(skin) => {
                        let _ = write!(o, "{skin}");
                    }
                    None => {
                        let _ = write!(o, "(current)");
                    }
                }
                let _ = write!(o, ", view = {} with ", render.view);
                match &render.with {
                    Some(with) => {
                        let _ = write!(o, "{with}");
                    }
                    None => {
                        let _ = write!(o, "(current)");
                    }
                }
                let _ = writeln!(o, " content");
            }
            NodeKind::Using(using) => {
                let _ = write!(o, "{p}using view type {} as {} with ", using.id, using.as_id);
                match &using.with {
                    Some(with) => {
                        let _ = write!(o, "{with}");
                    }
                    None => {
                        let _ = write!(o, "(current)");
                    }
                }
                let _ = writeln!(o, " content [");
                self.dump_children(&using.children, o, depth + 1);
                let _ = writeln!(o, "{p}]");
            }
            NodeKind::If(if_node) => {
                let _ = writeln!(o, "{p}if with {} branches [", if_node.conditions.len());
                self.dump_children(&if_node.conditions, o, depth + 1);
                let _ = writeln!(o, "{p}]");
            }
            NodeKind::Condition(cond) => {
                let _ = write!(o, "if ");
                Self::dump_condition_clause(o, &p, cond.kind, cond.negate, &cond.variable, &cond.cpp);
                for link in &cond.chain {
                    let _ = write!(
                        o,
                        "{}",
                        match link.op {
                            ChainOp::Or => " or ",
                            ChainOp::And => " and ",
                        }
                    );
                    Self::dump_condition_clause(o, &p, link.kind, link.negate, &link.variable, &None);
                }
                let _ = writeln!(o, " [");
                self.dump_children(&cond.children, o, depth + 1);
                let _ = writeln!(o, "{p}]");
            }
            NodeKind::Foreach(f) => {
                let _ = write!(o, "{p}foreach {}", f.item);
                if let Some(as_id) = &f.as_id {
                    let _ = write!(o, " (as {as_id})");
                }
                if let Some(rowid) = &f.rowid {
                    let _ = write!(o, " (and rowid named {rowid})");
                }
                let _ = write!(o, " starting from row {}", f.from);
                let _ = writeln!(
                    o,
                    " in {}{}{{",
                    if f.reverse { "reversed array " } else { "array " },
                    f.array
                );
                for (label, part) in [
                    ("empty", f.empty),
                    ("separator", f.separator),
                    ("item", f.item_part),
                    ("item prefix", f.prefix),
                    ("item suffix", f.suffix),
                ] {
                    match part {
                        Some(part) => {
                            let _ = writeln!(o, "{p}\t{label} = [");
                            self.dump_node(part, o, depth + 2);
                            let _ = writeln!(o, "{p}\t]");
                        }
                        None => {
                            let _ = writeln!(o, "{p}\t{label} not set");
                        }
                    }
                }
                let _ = writeln!(o, "{p}}}");
            }
            NodeKind::ForeachPart(part) => {
                self.dump_children(&part.children, o, depth);
            }
            NodeKind::Cache(cache) => {
                let _ = write!(o, "{p}cache {}", cache.key);
                if cache.duration > -1 {
                    let _ = write!(o, " (cached for {}s)", cache.duration);
                }
                if let Some(miss) = &cache.miss {
                    let _ = write!(o, " (call {miss} on miss)");
                }
                let _ = write!(
                    o,
                    " recording is {} and triggers are {}",
                    if cache.recording { "ON" } else { "OFF" },
                    if cache.triggers { "ON" } else { "OFF" }
                );
                if cache.trigger_list.is_empty() {
                    let _ = writeln!(o, " - no triggers");
                } else {
                    let _ = writeln!(o, " - triggers [");
                    for (_, trigger) in &cache.trigger_list {
                        let _ = writeln!(o, "{p}\t{trigger}");
                    }
                    let _ = writeln!(o, "{p}]");
                }
                let _ = writeln!(o, "{p}cache children = [");
                self.dump_children(&cache.children, o, depth + 1);
                let _ = writeln!(o, "{p}]");
            }
        }
    }

    fn dump_condition_clause(
        o: &mut String,
        p: &str,
        kind: CondKind,
        negate: bool,
        variable: &Option<Variable>,
        cpp: &Option<Cpp>,
    ) {
        let neg = if negate { "not " } else { "" };
        let _ = match kind {
            CondKind::Regular => write!(
                o,
                "{p}{neg}true: {}",
                variable.as_ref().map(|v| v.to_string()).unwrap_or_default()
            ),
            CondKind::Empty => write!(
                o,
                "{p}{neg}empty: {}",
                variable.as_ref().map(|v| v.to_string()).unwrap_or_default()
            ),
            CondKind::Rtl => write!(o, "{p}{neg}rtl"),
            CondKind::Cpp => write!(
                o,
                "{p}{neg}cpp: {}",
                cpp.as_ref().map(|c| c.to_string()).unwrap_or_default()
            ),
            CondKind::Else => write!(o, "{p}else: "),
        };
    }
}
