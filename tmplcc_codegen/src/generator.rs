use std::fmt::Write as _;

use tmplcc_parser::expr::{CallList, CallPrefix, Cpp, Filter, Operand, Variable};
use tmplcc_parser::node::{
    Ast, ChainOp, CondKind, FmtVerb, NodeId, NodeKind, Skin, UsingOption,
};
use tmplcc_parser::source::Position;

use crate::{Context, EmitError, ViewEntry};

const DEFAULT_ESCAPER: &str = "cppcms::filters::escape";

/// Emits host-language source for a parsed tree. The body is buffered so
/// that `#include` lines requested during emission can be written first.
pub fn generate(ast: &Ast, ctx: &mut Context) -> Result<String, EmitError> {
    let root = ast.root();
    if root.skins.is_empty() {
        return Err(EmitError::Plain("No skins defined".to_string()));
    }

    // Resolve the __default__ skin against the requested rename; the
    // renamed skin moves to the end, matching registration order.
    let mut skins: Vec<(String, &Skin)> = Vec::new();
    let mut default_skin: Option<&Skin> = None;
    for skin in &root.skins {
        if skin.name.repr() == "__default__" {
            default_skin = Some(skin);
        } else {
            skins.push((skin.name.repr().to_string(), skin));
        }
    }
    if let Some(skin) = default_skin {
        match ctx.skin.as_deref() {
            Some(name) if !name.is_empty() => skins.push((name.to_string(), skin)),
            _ => {
                return Err(EmitError::AtLine(
                    skin.pos.clone(),
                    "Requested default skin name, but none was provided in arguments"
                        .to_string(),
                ))
            }
        }
    }

    let mut g = Generator {
        ast,
        buf: String::new(),
    };

    for code in &root.codes {
        g.ln(&code.pos);
        g.writeln(&code.code.value);
    }

    for (name, skin) in &skins {
        if let Some(requested) = ctx.skin.as_deref() {
            if !requested.is_empty() && requested != name {
                return Err(EmitError::AtLine(
                    skin.pos.clone(),
                    "Mismatched skin names, in argument and template source".to_string(),
                ));
            }
        }
        g.ln(&skin.pos);
        g.writeln(&format!("namespace {name} {{"));
        ctx.current_skin = name.clone();
        for &view in &skin.views {
            g.write_view(view, ctx)?;
        }
        g.ln(&skin.endpos);
        g.writeln(&format!("}} // end of namespace {name}"));
    }

    // past the last line of the last skin
    let mut pll = skins.last().expect("checked").1.endpos.clone();
    pll.line += 1;

    for (skin_name, views) in &ctx.skins {
        g.write("\n");
        g.ln(&pll);
        g.writeln("namespace {");
        g.ln(&pll);
        g.writeln("cppcms::views::generator my_generator;");
        g.ln(&pll);
        g.writeln("struct loader {");
        g.ln(&pll);
        g.writeln("loader() {");
        g.ln(&pll);
        g.writeln(&format!("my_generator.name(\"{skin_name}\");"));
        for ViewEntry { name, data } in views {
            g.ln(&pll);
            g.writeln(&format!(
                "my_generator.add_view< {skin_name}::{name}, {data} >(\"{name}\", true);"
            ));
        }
        g.ln(&pll);
        g.writeln("cppcms::views::pool::instance().add(my_generator);");
        g.ln(&pll);
        g.writeln("}");
        g.ln(&pll);
        g.writeln("~loader() { cppcms::views::pool::instance().remove(my_generator); }");
        g.ln(&pll);
        g.writeln("} a_loader;");
        g.ln(&pll);
        g.writeln("} // anon ");
    }

    let mut output = String::new();
    for include in ctx.includes() {
        let _ = writeln!(output, "#include <{include}>");
    }
    output.push_str(&g.buf);
    Ok(output)
}

struct Generator<'a> {
    ast: &'a Ast,
    buf: String,
}

impl<'a> Generator<'a> {
    /// Line pragma pointing back at the template source.
    fn ln(&mut self, pos: &Position) {
        let _ = writeln!(self.buf, "#line {} \"{}\"", pos.line, pos.file);
    }

    fn write(&mut self, s: &str) {
        self.buf.push_str(s);
    }

    fn writeln(&mut self, s: &str) {
        self.buf.push_str(s);
        self.buf.push('\n');
    }

    fn write_view(&mut self, id: NodeId, ctx: &mut Context) -> Result<(), EmitError> {
        let ast = self.ast;
        let node = ast.node(id);
        let NodeKind::View(view) = &node.kind else {
            return Err(EmitError::Logic("expected a view node".to_string()));
        };
        ctx.skins
            .entry(ctx.current_skin.clone())
            .or_default()
            .push(ViewEntry {
                name: view.name.repr().to_string(),
                data: view.data.repr().to_string(),
            });
        let pos = &node.pos;
        self.ln(pos);
        self.write(&format!("struct {}:public ", view.name.repr()));
        match &view.master {
            Some(master) => self.writeln(master.repr()),
            None => self.writeln("cppcms::base_view"),
        }
        self.ln(pos);
        self.writeln(" {");

        self.ln(pos);
        self.writeln(&format!("{} & content;", view.data.repr()));

        self.ln(pos);
        self.write(&format!(
            "{}(std::ostream & _s, {} & _content):",
            view.name.repr(),
            view.data.repr()
        ));
        match &view.master {
            Some(master) => self.write(&format!("{}(_s, _content)", master.repr())),
            None => self.write("cppcms::base_view(_s)"),
        }
        self.writeln(",content(_content)");
        self.ln(pos);
        self.writeln("{");
        self.ln(pos);
        self.writeln("}");

        for &template in &view.templates {
            self.write_template(template, ctx)?;
        }

        self.ln(&view.endpos);
        self.writeln(&format!("}}; // end of class {}", view.name.repr()));
        Ok(())
    }

    fn write_template(&mut self, id: NodeId, ctx: &mut Context) -> Result<(), EmitError> {
        let ast = self.ast;
        let node = ast.node(id);
        let NodeKind::Template(template) = &node.kind else {
            return Err(EmitError::Logic("expected a template node".to_string()));
        };
        let pos = &node.pos;
        if !template.template_args.is_empty() {
            self.ln(pos);
            self.write("template<");
            for (i, arg) in template.template_args.iter().enumerate() {
                if i > 0 {
                    self.write(", ");
                }
                self.write(&format!("typename {}", arg.repr()));
            }
            self.writeln(">");
            self.ln(pos);
            self.writeln(&format!(
                "void {}{}{{",
                template.name.repr(),
                template.params.repr()
            ));
        } else {
            self.ln(pos);
            self.writeln(&format!(
                "virtual void {}{}{{",
                template.name.repr(),
                template.params.repr()
            ));
        }
        for param in &template.params.params {
            ctx.add_scope_variable(param.name.repr())?;
        }
        for &child in &template.children {
            self.write_node(child, ctx)?;
        }
        for param in &template.params.params {
            ctx.remove_scope_variable(param.name.repr());
        }
        self.ln(&template.endpos);
        self.writeln(&format!("}} // end of template {}", template.name.repr()));
        Ok(())
    }

    fn write_children(&mut self, children: &[NodeId], ctx: &mut Context) -> Result<(), EmitError> {
        for &child in children {
            self.write_node(child, ctx)?;
        }
        Ok(())
    }

    fn write_node(&mut self, id: NodeId, ctx: &mut Context) -> Result<(), EmitError> {
        let ast = self.ast;
        let node = ast.node(id);
        let pos = &node.pos;
        match &node.kind {
            NodeKind::Root(_) => Err(EmitError::Logic(
                "root node emitted as a statement".to_string(),
            )),
            NodeKind::View(_) => self.write_view(id, ctx),
            NodeKind::Template(_) => self.write_template(id, ctx),
            NodeKind::Text(text) => {
                self.ln(pos);
                self.writeln(&format!("out() << \"{}\";", text.value.value));
                Ok(())
            }
            NodeKind::CppCode(cpp) => {
                self.ln(pos);
                self.writeln(&cpp.code.value);
                Ok(())
            }
            NodeKind::VariableEmit(v) => {
                self.ln(pos);
                let code =
                    variable_emit_code(&v.variable, &v.filters, ctx, DEFAULT_ESCAPER);
                self.writeln(&format!("out() << {code};"));
                Ok(())
            }
            NodeKind::FmtFunction(f) => {
                self.ln(pos);
                match f.verb {
                    FmtVerb::Gt => {
                        if f.options.is_empty() {
                            self.writeln(&format!(
                                "out() << cppcms::locale::translate({});",
                                f.fmt.repr()
                            ));
                        } else {
                            self.write(&format!(
                                "out() << cppcms::locale::format(cppcms::locale::translate({})) ",
                                f.fmt.repr()
                            ));
                            for uo in &f.options {
                                let code = using_option_code(uo, ctx, DEFAULT_ESCAPER);
                                self.write(&format!(" % ({code})"));
                            }
                            self.writeln(";");
                        }
                    }
                    FmtVerb::Url => {
                        self.write(&format!(
                            "content.app().mapper().map(out(), {}",
                            f.fmt.repr()
                        ));
                        for uo in &f.options {
                            let code = using_option_code(uo, ctx, "cppcms::filters::urlencode");
                            self.write(&format!(", {code}"));
                        }
                        self.writeln(");");
                    }
                    FmtVerb::Format => {
                        ctx.add_include("boost/format.hpp");
                        self.write(&format!(
                            "out() << cppcms::filters::escape((boost::format({})",
                            f.fmt.repr()
                        ));
                        for uo in &f.options {
                            let code = using_option_code(uo, ctx, "");
                            self.write(&format!("% ({code})"));
                        }
                        self.writeln(").str());");
                    }
                    FmtVerb::Rformat => {
                        ctx.add_include("boost/format.hpp");
                        self.write(&format!("out() << (boost::format({})", f.fmt.repr()));
                        for uo in &f.options {
                            let code = using_option_code(uo, ctx, "");
                            self.write(&format!("% ({code})"));
                        }
                        self.writeln(").str();");
                    }
                }
                Ok(())
            }
            NodeKind::Ngt(ngt) => {
                self.ln(pos);
                let variable = variable_code(&ngt.variable, ctx);
                if ngt.options.is_empty() {
                    self.writeln(&format!(
                        "out() << cppcms::locale::translate({}, {}, {variable});",
                        ngt.singular.repr(),
                        ngt.plural.repr()
                    ));
                } else {
                    self.write(&format!(
                        "out() << cppcms::locale::format(cppcms::locale::translate({}, {}, {variable})) ",
                        ngt.singular.repr(),
                        ngt.plural.repr()
                    ));
                    for uo in &ngt.options {
                        let code = using_option_code(uo, ctx, DEFAULT_ESCAPER);
                        self.write(&format!(" % ({code})"));
                    }
                    self.writeln(";");
                }
                Ok(())
            }
            NodeKind::Include(include) => {
                self.ln(pos);
                if let Some(from) = &include.from {
                    if !ctx.check_scope_variable(from.repr()) {
                        return Err(EmitError::AtLine(
                            pos.clone(),
                            format!(
                                "No local view variable {} found in context.",
                                from.repr()
                            ),
                        ));
                    }
                    self.writeln(&format!("{};", call_code(&include.call, None, ctx)));
                } else if let Some(using_view) = &include.using_view {
                    self.writeln("{");
                    if let Some(with) = &include.with {
                        self.ln(pos);
                        self.writeln(&format!(
                            "cppcms::base_content::app_guard _g({}, content);",
                            variable_code(with, ctx)
                        ));
                    }
                    self.ln(pos);
                    self.write(&format!("{} _using(out(), ", using_view.repr()));
                    match &include.with {
                        Some(with) => {
                            let code = variable_code(with, ctx);
                            self.write(&code);
                        }
                        None => self.write("content"),
                    }
                    self.writeln(");");
                    self.ln(pos);
                    self.writeln(&format!("{};", call_code(&include.call, None, ctx)));
                    self.ln(pos);
                    self.writeln("}");
                } else {
                    self.writeln(&format!("{};", call_code(&include.call, None, ctx)));
                }
                Ok(())
            }
            NodeKind::Using(using) => {
                self.ln(pos);
                self.writeln("{");
                if let Some(with) = &using.with {
                    self.ln(pos);
                    self.writeln(&format!(
                        "cppcms::base_content::app_guard _g({}, content);",
                        variable_code(with, ctx)
                    ));
                }
                self.ln(pos);
                self.write(&format!("{} {}(out(), ", using.id.repr(), using.as_id.repr()));
                match &using.with {
                    Some(with) => {
                        let code = variable_code(with, ctx);
                        self.write(&code);
                    }
                    None => self.write("content"),
                }
                self.writeln(");");
                ctx.add_scope_variable(using.as_id.repr())?;
                self.write_children(&using.children, ctx)?;
                ctx.remove_scope_variable(using.as_id.repr());
                self.ln(&using.endpos);
                self.writeln("}");
                Ok(())
            }
            NodeKind::If(if_node) => {
                let mut conditions = if_node.conditions.iter();
                let &first = conditions
                    .next()
                    .ok_or_else(|| EmitError::Logic("if without conditions".to_string()))?;
                self.write_condition(first, ctx)?;

                for &id in conditions {
                    if condition_kind(ast, id)? == CondKind::Else {
                        self.write(" else ");
                    } else {
                        self.write("\n");
                        self.ln(&ast.node(id).pos);
                        self.writeln("else");
                    }
                    self.write_condition(id, ctx)?;
                }
                let &last = if_node.conditions.last().expect("checked");
                if condition_kind(ast, last)? == CondKind::Else {
                    self.write("\n");
                } else {
                    self.write(" // endif\n");
                }
                Ok(())
            }
            NodeKind::Condition(_) => self.write_condition(id, ctx),
            NodeKind::Foreach(_) => self.write_foreach(id, ctx),
            NodeKind::ForeachPart(part) => self.write_children(&part.children, ctx),
            NodeKind::Cache(_) => self.write_cache(id, ctx),
            NodeKind::Render(render) => {
                self.ln(pos);
                self.writeln("{");
                if let Some(with) = &render.with {
                    self.ln(pos);
                    self.writeln(&format!(
                        "cppcms::base_content::app_guard _g({}, content);",
                        variable_code(with, ctx)
                    ));
                }
                self.ln(pos);
                self.write("cppcms::views::pool::instance().render(");
                match &render.skin {
                    Some(skin) => {
                        let code = operand_code(skin, ctx);
                        self.write(&code);
                    }
                    None => self.write(&format!("\"{}\"", ctx.current_skin)),
                }
                let view = operand_code(&render.view, ctx);
                self.write(&format!(", {view}, out(), "));
                match &render.with {
                    Some(with) => {
                        let code = variable_code(with, ctx);
                        self.write(&code);
                    }
                    None => self.write("content"),
                }
                self.writeln(");");
                self.ln(pos);
                self.writeln("}");
                Ok(())
            }
            NodeKind::Csrf(csrf) => self.write_csrf(pos, csrf.style.as_ref().map(|s| s.repr()), ctx),
            NodeKind::Form(_) => self.write_form(id, ctx),
        }
    }

    fn write_condition(&mut self, id: NodeId, ctx: &mut Context) -> Result<(), EmitError> {
        let ast = self.ast;
        let node = ast.node(id);
        let NodeKind::Condition(cond) = &node.kind else {
            return Err(EmitError::Logic("expected a condition node".to_string()));
        };
        if cond.kind != CondKind::Else {
            self.ln(&node.pos);
            self.write("if(");
        }

        self.write_clause(cond.kind, cond.negate, &cond.variable, &cond.cpp, ctx)?;
        for link in &cond.chain {
            self.write(match link.op {
                ChainOp::Or => " || ",
                ChainOp::And => " && ",
            });
            self.write_clause(link.kind, link.negate, &link.variable, &None, ctx)?;
        }

        if cond.kind != CondKind::Else {
            self.writeln(") {");
        } else {
            self.writeln(" {");
        }
        self.write_children(&cond.children, ctx)?;
        self.ln(&cond.endpos);
        self.write("} ");
        Ok(())
    }

    fn write_clause(
        &mut self,
        kind: CondKind,
        negate: bool,
        variable: &Option<Variable>,
        cpp: &Option<Cpp>,
        ctx: &Context,
    ) -> Result<(), EmitError> {
        if negate {
            self.write("!(");
        }
        match kind {
            CondKind::Regular => {
                let variable = variable
                    .as_ref()
                    .ok_or_else(|| EmitError::Logic("condition without variable".to_string()))?;
                let code = variable_code(variable, ctx);
                self.write(&code);
            }
            CondKind::Empty => {
                let variable = variable
                    .as_ref()
                    .ok_or_else(|| EmitError::Logic("condition without variable".to_string()))?;
                let code = variable_code(variable, ctx);
                self.write(&format!("{code}.empty()"));
            }
            CondKind::Rtl => {
                self.write("(cppcms::locale::translate(\"LTR\").str(out().getloc()) == \"RTL\")");
            }
            CondKind::Cpp => {
                let cpp = cpp
                    .as_ref()
                    .ok_or_else(|| EmitError::Logic("condition without expression".to_string()))?;
                self.write(&cpp.value);
            }
            CondKind::Else => {}
        }
        if negate {
            self.write(")");
        }
        Ok(())
    }

    fn write_foreach(&mut self, id: NodeId, ctx: &mut Context) -> Result<(), EmitError> {
        let ast = self.ast;
        let node = ast.node(id);
        let NodeKind::Foreach(foreach) = &node.kind else {
            return Err(EmitError::Logic("expected a foreach node".to_string()));
        };
        let pos = &node.pos;

        let array = format!("({})", variable_code(&foreach.array, ctx));
        let item = foreach.item.repr().to_string();
        let rowid = foreach
            .rowid
            .as_ref()
            .map(|r| r.repr().to_string())
            .unwrap_or_else(|| "__rowid".to_string());
        let (begin, end) = if foreach.reverse {
            ("rbegin", "rend")
        } else {
            ("begin", "end")
        };
        let ty = match &foreach.as_id {
            Some(as_id) => as_id.repr().to_string(),
            None => format!("CPPCMS_TYPEOF({array}.{begin}())"),
        };
        let vtype = match &foreach.as_id {
            Some(_) => format!("std::iterator_traits <{ty} >::value_type"),
            None => format!("CPPCMS_TYPEOF(*{item}_ptr)"),
        };

        self.ln(pos);
        self.writeln(&format!("if({array}.{begin}() != {array}.{end}()) {{"));
        if foreach.rowid.is_some() {
            self.ln(pos);
            self.writeln(&format!("int {rowid} = 1;"));
        }
        if let Some(prefix) = foreach.prefix {
            self.write_node(prefix, ctx)?;
        }

        let item_id = foreach
            .item_part
            .ok_or_else(|| EmitError::Logic("foreach without an item part".to_string()))?;
        let item_pos = ast.node(item_id).pos.clone();
        let item_endpos = part_endpos(ast, item_id)?;

        self.ln(&item_pos);
        self.write(&format!(
            "for ({ty} {item}_ptr = {array}.{begin}(), {item}_ptr_end = {array}.{end}(); \
             {item}_ptr != {item}_ptr_end; ++{item}_ptr"
        ));
        if foreach.rowid.is_some() {
            self.writeln(&format!(", ++{rowid}) {{"));
        } else {
            self.writeln(") {");
        }

        self.ln(&item_pos);
        self.writeln(&format!("{vtype} & {item} = *{item}_ptr;"));

        if foreach.rowid.is_some() {
            ctx.add_scope_variable(&rowid)?;
        }
        ctx.add_scope_variable(&item)?;
        if let Some(separator) = foreach.separator {
            let sep_pos = ast.node(separator).pos.clone();
            self.ln(&sep_pos);
            self.writeln(&format!("if({item}_ptr != {array}.{begin}()) {{"));
            self.write_node(separator, ctx)?;
            let sep_endpos = part_endpos(ast, separator)?;
            self.ln(&sep_endpos);
            self.writeln("} // end of separator");
        }
        self.write_node(item_id, ctx)?;

        if foreach.rowid.is_some() {
            ctx.remove_scope_variable(&rowid);
        }
        ctx.remove_scope_variable(&item);
        self.ln(&item_endpos);
        self.writeln("} // end of item");

        if let Some(suffix) = foreach.suffix {
            self.write_node(suffix, ctx)?;
        }

        if let Some(empty) = foreach.empty {
            let empty_pos = ast.node(empty).pos.clone();
            self.ln(&empty_pos);
            self.writeln("} else {");
            self.write_node(empty, ctx)?;
            let empty_endpos = part_endpos(ast, empty)?;
            self.ln(&empty_endpos);
            self.writeln("} // end of empty");
        } else {
            let close_pos = match foreach.suffix {
                Some(suffix) => part_endpos(ast, suffix)?,
                None => item_endpos,
            };
            self.ln(&close_pos);
            self.writeln("}");
        }
        Ok(())
    }

    fn write_cache(&mut self, id: NodeId, ctx: &mut Context) -> Result<(), EmitError> {
        let ast = self.ast;
        let node = ast.node(id);
        let NodeKind::Cache(cache) = &node.kind else {
            return Err(EmitError::Logic("expected a cache node".to_string()));
        };
        let pos = &node.pos;
        let key = operand_code(&cache.key, ctx);

        self.ln(pos);
        self.writeln("{");
        self.writeln("std::string _cppcms_temp_val;");
        self.ln(pos);
        self.writeln(&format!(
            "\tif (content.app().cache().fetch_frame({key}, _cppcms_temp_val))"
        ));
        self.ln(pos);
        self.writeln("\t\tout() << _cppcms_temp_val;");
        self.ln(pos);
        self.writeln("\telse {");
        self.ln(pos);
        self.writeln("\t\tcppcms::copy_filter _cppcms_cache_flt(out());");
        if cache.recording {
            self.ln(pos);
            self.writeln("\t\tcppcms::triggers_recorder _cppcms_trig_rec(content.app().cache());");
        }
        if let Some(miss) = &cache.miss {
            self.ln(pos);
            self.writeln(&format!("\t\t{};", variable_code(miss, ctx)));
        }
        self.write_children(&cache.children, ctx)?;
        self.ln(&cache.endpos);
        self.write(&format!(
            "content.app().cache().store_frame({key}, _cppcms_cache_flt.detach(),"
        ));
        if cache.recording {
            self.write("_cppcms_trig_rec.detach(),");
        } else {
            self.write("std::set <std::string > (),");
        }
        self.writeln(&format!(
            "{}, {});",
            cache.duration,
            if cache.triggers { "false" } else { "true" }
        ));
        self.ln(&cache.endpos);
        self.writeln("\t}} // cache");
        Ok(())
    }

    fn write_csrf(
        &mut self,
        pos: &Position,
        style: Option<&str>,
        _ctx: &Context,
    ) -> Result<(), EmitError> {
        match style {
            None => {
                self.ln(pos);
                self.writeln(
                    "out() << \"<input type=\\\"hidden\\\" name=\\\"_csrf\\\" value=\\\"\" \
                     << content.app().session().get_csrf_token() << \"\\\" >\\n\";",
                );
            }
            Some("token") => {
                self.ln(pos);
                self.writeln("out() << content.app().session().get_csrf_token();");
            }
            Some("script") => {
                self.ln(pos);
                self.writeln(CSRF_SCRIPT);
            }
            Some("cookie") => {
                self.ln(pos);
                self.writeln("out() << content.app().session().get_csrf_token_cookie_name();");
            }
            Some(other) => {
                return Err(EmitError::Logic(format!("Invalid csrf style: {other}")));
            }
        }
        Ok(())
    }

    fn write_form(&mut self, id: NodeId, ctx: &mut Context) -> Result<(), EmitError> {
        let ast = self.ast;
        let node = ast.node(id);
        let NodeKind::Form(form) = &node.kind else {
            return Err(EmitError::Logic("expected a form node".to_string()));
        };
        let pos = &node.pos;
        let mode = ctx.output_mode.clone();
        let name = variable_code(&form.variable, ctx);
        match form.style.repr() {
            "as_table" | "as_p" | "as_ul" | "as_dl" | "as_space" => {
                self.ln(pos);
                self.write("{ ");
                self.write(&format!(
                    "cppcms::form_context _form_context(out(), cppcms::form_flags::as_{mode}, \
                     cppcms::form_flags::{}); ",
                    form.style.repr()
                ));
                self.write(&format!("({name}).render(_form_context); "));
                self.writeln("}");
            }
            "input" => {
                self.ln(pos);
                self.writeln(&format!(
                    " {{ cppcms::form_context _form_context(out(),cppcms::form_flags::as_{mode});"
                ));
                self.ln(pos);
                self.writeln("_form_context.widget_part(cppcms::form_context::first_part);");
                self.ln(pos);
                self.writeln(&format!("({name}).render_input(_form_context);"));
                self.ln(pos);
                self.writeln(&format!("out() << ({name}).attributes_string();"));
                self.ln(pos);
                self.writeln("_form_context.widget_part(cppcms::form_context::second_part);");
                self.ln(pos);
                self.writeln(&format!("({name}).render_input(_form_context);"));
                self.ln(pos);
                self.writeln("}");
            }
            "begin" | "block" => {
                self.ln(pos);
                self.writeln(&format!(
                    " {{ cppcms::form_context _form_context(out(),cppcms::form_flags::as_{mode});"
                ));
                self.ln(pos);
                self.writeln("_form_context.widget_part(cppcms::form_context::first_part);");
                self.ln(pos);
                self.writeln(&format!("({name}).render_input(_form_context);"));
                self.ln(pos);
                self.writeln("}");
                self.write_children(&form.children, ctx)?;
                self.ln(&form.endpos);
                self.writeln(&format!(
                    " {{ cppcms::form_context _form_context(out(),cppcms::form_flags::as_{mode});"
                ));
                self.ln(&form.endpos);
                self.writeln("_form_context.widget_part(cppcms::form_context::second_part);");
                self.ln(&form.endpos);
                self.writeln(&format!("({name}).render_input(_form_context);"));
                self.ln(&form.endpos);
                self.writeln("}");
            }
            _ => {}
        }
        Ok(())
    }
}

fn condition_kind(ast: &Ast, id: NodeId) -> Result<CondKind, EmitError> {
    match &ast.node(id).kind {
        NodeKind::Condition(cond) => Ok(cond.kind),
        _ => Err(EmitError::Logic("expected a condition node".to_string())),
    }
}

fn part_endpos(ast: &Ast, id: NodeId) -> Result<Position, EmitError> {
    match &ast.node(id).kind {
        NodeKind::ForeachPart(part) => Ok(part.endpos.clone()),
        _ => Err(EmitError::Logic("expected a foreach part".to_string())),
    }
}

/// `(string | number | variable)` rendering.
fn operand_code(operand: &Operand, ctx: &Context) -> String {
    match operand {
        Operand::Str(s) => s.repr().to_string(),
        Operand::Num(n) => n.repr().to_string(),
        Operand::Var(v) => variable_code(v, ctx),
    }
}

/// Renders a variable's part chain. The head name is prefixed with the
/// configured variable prefix unless it is a known scope variable; later
/// parts are emitted as written.
fn variable_code(variable: &Variable, ctx: &Context) -> String {
    let mut o = String::new();
    if variable.is_deref {
        o.push('*');
    }

    let mut first = true;
    for part in &variable.parts {
        if !first || ctx.check_scope_variable(&part.name) {
            o.push_str(&part.name);
        } else {
            o.push_str(&ctx.variable_prefix);
            o.push_str(&part.name);
        }
        first = false;

        if part.is_function {
            o.push('(');
            for (i, argument) in part.arguments.iter().enumerate() {
                if i > 0 {
                    o.push_str(", ");
                }
                o.push_str(&operand_code(argument, ctx));
            }
            o.push(')');
        }
        o.push_str(part.separator);
    }
    o
}

/// Renders a call list, prepending `current_argument` when the call is a
/// filter application.
fn call_code(call: &CallList, current_argument: Option<&str>, ctx: &Context) -> String {
    let mut o = String::new();
    match &call.prefix {
        CallPrefix::Empty => {}
        CallPrefix::Fixed(prefix) => o.push_str(prefix),
        CallPrefix::ContentScoped => o.push_str(&ctx.variable_prefix),
    }
    o.push_str(&call.head);
    o.push('(');
    let mut arguments = Vec::with_capacity(call.arguments.len() + 1);
    if let Some(current) = current_argument {
        arguments.push(current.to_string());
    }
    for argument in &call.arguments {
        arguments.push(operand_code(argument, ctx));
    }
    o.push_str(&arguments.join(", "));
    o.push(')');
    o
}

/// Applies a filter chain right-to-left: `x | f | g` renders as `g(f(x))`.
/// The default escaper wraps the bare variable only when no filters are
/// given.
fn variable_emit_code(
    variable: &Variable,
    filters: &[Filter],
    ctx: &Context,
    escaper: &str,
) -> String {
    if filters.is_empty() {
        if escaper.is_empty() {
            variable_code(variable, ctx)
        } else {
            format!("{escaper}({})", variable_code(variable, ctx))
        }
    } else {
        let mut current = variable_code(variable, ctx);
        for filter in filters {
            current = call_code(&filter.call, Some(&current), ctx);
        }
        current
    }
}

fn using_option_code(option: &UsingOption, ctx: &Context, escaper: &str) -> String {
    variable_emit_code(&option.variable, &option.filters, ctx, escaper)
}

const CSRF_SCRIPT: &str = r#"                        out() << "\n"
"            <script type='text/javascript'>\n"
"            <!--\n"
"                {\n"
"                    var cppcms_cs = document.cookie.indexOf(\""<< content.app().session().get_csrf_token_cookie_name() <<"=\");\n"
"                    if(cppcms_cs != -1) {\n"
"                        cppcms_cs += '"<< content.app().session().get_csrf_token_cookie_name() <<"='.length;\n"
"                        var cppcms_ce = document.cookie.indexOf(\";\",cppcms_cs);\n"
"                        if(cppcms_ce == -1) {\n"
"                            cppcms_ce = document.cookie.length;\n"
"                        }\n"
"                        var cppcms_token = document.cookie.substring(cppcms_cs,cppcms_ce);\n"
"                        document.write('<input type=\"hidden\" name=\"_csrf\" value=\"' + cppcms_token + '\" >');\n"
"                    }\n"
"                }\n"
"            -->\n"
"            </script>\n"
"            ";"#;
