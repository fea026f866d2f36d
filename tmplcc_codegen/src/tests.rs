use tmplcc_parser::{SourceFile, TemplateParser};

use crate::{generate, Config, Context, EmitError};

fn parse(input: &str) -> TemplateParser {
    let mut parser = TemplateParser::new(vec![SourceFile::new("test.tmpl", input)]);
    parser.parse().unwrap();
    parser
}

fn wrap(body: &str) -> String {
    format!(
        "<% skin s %><% view v uses data::content %><% template render() %>{body}\
         <% end template %><% end view %><% end skin %>"
    )
}

fn emit(input: &str) -> String {
    let parser = parse(input);
    let mut ctx = Context::new();
    generate(parser.ast(), &mut ctx).unwrap()
}

fn emit_body(body: &str) -> String {
    emit(&wrap(body))
}

fn emit_err(input: &str) -> EmitError {
    let parser = parse(input);
    let mut ctx = Context::new();
    generate(parser.ast(), &mut ctx).unwrap_err()
}

#[test]
fn test_minimal_view() {
    let out = emit(
        "<% skin s %><% view x uses data::t %><% template render() %>Hello\
         <% end template %><% end view %><% end skin %>",
    );
    assert!(out.contains("namespace s {"), "{out}");
    assert!(out.contains("struct x:public cppcms::base_view"), "{out}");
    assert!(out.contains("data::t & content;"), "{out}");
    assert!(out.contains("virtual void render()"), "{out}");
    assert!(out.contains("out() << \"Hello\";"), "{out}");
    assert!(out.contains("} // end of namespace s"), "{out}");
    assert!(
        out.contains("my_generator.add_view< s::x, data::t >(\"x\", true);"),
        "{out}"
    );
    assert!(out.contains("my_generator.name(\"s\");"), "{out}");
    assert!(
        out.contains("cppcms::views::pool::instance().add(my_generator);"),
        "{out}"
    );
}

#[test]
fn test_default_skin_rename() {
    let source = "<% skin %><% view x uses data::t %><% template render() %>Hello\
                  <% end template %><% end view %><% end skin %>";
    let parser = parse(source);
    let mut ctx = Context::new();
    ctx.skin = Some("mirror".to_string());
    let out = generate(parser.ast(), &mut ctx).unwrap();
    assert!(out.contains("namespace mirror {"), "{out}");
    assert!(
        out.contains("my_generator.add_view< mirror::x, data::t >(\"x\", true);"),
        "{out}"
    );

    // renaming to the literal default name is allowed too
    let parser = parse(source);
    let mut ctx = Context::new();
    ctx.skin = Some("__default__".to_string());
    let out = generate(parser.ast(), &mut ctx).unwrap();
    assert!(out.contains("namespace __default__ {"), "{out}");
    assert!(
        out.contains("my_generator.add_view< __default__::x, data::t >(\"x\", true);"),
        "{out}"
    );
}

#[test]
fn test_default_skin_without_name_is_rejected() {
    let err = emit_err(
        "<% skin %><% view x uses data::t %><% template render() %>\
         <% end template %><% end view %><% end skin %>",
    );
    let EmitError::AtLine(_, msg) = err else {
        panic!("expected a positioned error, got {err:?}");
    };
    assert!(msg.contains("Requested default skin name"), "{msg}");
}

#[test]
fn test_mismatched_skin_names_rejected() {
    let parser = parse(
        "<% skin one %><% view x uses data::t %><% template render() %>\
         <% end template %><% end view %><% end skin %>",
    );
    let mut ctx = Context::new();
    ctx.skin = Some("two".to_string());
    let err = generate(parser.ast(), &mut ctx).unwrap_err();
    let EmitError::AtLine(_, msg) = err else {
        panic!("expected a positioned error, got {err:?}");
    };
    assert!(msg.contains("Mismatched skin names"), "{msg}");
}

#[test]
fn test_no_skins_rejected() {
    let err = emit_err("");
    assert_eq!(err, EmitError::Plain("No skins defined".to_string()));
}

#[test]
fn test_skin_without_views() {
    let out = emit("<% skin empty_skin %><% end skin %>");
    assert!(out.contains("namespace empty_skin {"), "{out}");
    assert!(!out.contains("my_generator"), "{out}");
}

#[test]
fn test_view_extends_named_base() {
    let out = emit(
        "<% skin s %><% view x uses data::t extends base %><% template render() %>\
         <% end template %><% end view %><% end skin %>",
    );
    assert!(out.contains("struct x:public base"), "{out}");
    assert!(out.contains("base(_s, _content),content(_content)"), "{out}");
}

#[test]
fn test_filter_chain_is_right_fold() {
    let out = emit_body("<%= name | upper | escape %>");
    assert!(
        out.contains(
            "out() << cppcms::filters::escape(cppcms::filters::upper(content.name));"
        ),
        "{out}"
    );
}

#[test]
fn test_plain_variable_gets_default_escape() {
    let out = emit_body("<%= name %>");
    assert!(
        out.contains("out() << cppcms::filters::escape(content.name);"),
        "{out}"
    );
}

#[test]
fn test_ext_filter_resolves_in_content_scope() {
    let out = emit_body("<%= x | ext fmt %>");
    assert!(out.contains("out() << content.fmt(content.x);"), "{out}");
}

#[test]
fn test_filter_arguments_follow_the_input() {
    let out = emit_body("<%= x | pad(10) %>");
    assert!(
        out.contains("out() << cppcms::filters::pad(content.x, 10);"),
        "{out}"
    );
}

#[test]
fn test_template_parameters_are_scope_variables() {
    let out = emit(
        "<% skin s %><% view v uses data::c %>\
         <% template show(data::user const & who) %><%= who.name %><%= other %>\
         <% end template %><% end view %><% end skin %>",
    );
    assert!(out.contains("virtual void show(data::user const & who)"), "{out}");
    assert!(
        out.contains("out() << cppcms::filters::escape(who.name);"),
        "{out}"
    );
    assert!(
        out.contains("out() << cppcms::filters::escape(content.other);"),
        "{out}"
    );
}

#[test]
fn test_function_template() {
    let out = emit(
        "<% skin s %><% view v uses data::c %>\
         <% template show<T>(T const & value) %><% end template %>\
         <% end view %><% end skin %>",
    );
    assert!(out.contains("template<typename T>"), "{out}");
    assert!(out.contains("void show(T const & value)"), "{out}");
    assert!(!out.contains("virtual void show"), "{out}");
}

#[test]
fn test_if_chain_emission() {
    let out = emit_body("<% if not empty a and empty b or c %>x<% end if %>");
    assert!(
        out.contains("if(!(content.a.empty()) && content.b.empty() || content.c) {"),
        "{out}"
    );
    assert!(out.contains(" // endif"), "{out}");
}

#[test]
fn test_if_else_chain_emission() {
    let out = emit_body("<% if a %>x<% elif b %>y<% else %>z<% end if %>");
    assert!(out.contains("if(content.a) {"), "{out}");
    assert!(out.contains("if(content.b) {"), "{out}");
    assert!(out.contains("else"), "{out}");
    assert!(out.contains(" else  {"), "{out}");
}

#[test]
fn test_if_rtl_and_cpp_emission() {
    let out = emit_body("<% if rtl %>x<% end if %><% if (a == b) %>y<% end if %>");
    assert!(
        out.contains("if((cppcms::locale::translate(\"LTR\").str(out().getloc()) == \"RTL\")) {"),
        "{out}"
    );
    assert!(out.contains("if(a == b) {"), "{out}");
}

#[test]
fn test_foreach_emission() {
    let out = emit_body(
        "<% foreach x in items %><% item %><%= x %><% end item %>\
         <% separator %>,<% end foreach %>",
    );
    assert!(
        out.contains("if((content.items).begin() != (content.items).end()) {"),
        "{out}"
    );
    assert!(
        out.contains(
            "for (CPPCMS_TYPEOF((content.items).begin()) x_ptr = (content.items).begin(), \
             x_ptr_end = (content.items).end(); x_ptr != x_ptr_end; ++x_ptr) {"
        ),
        "{out}"
    );
    assert!(out.contains("CPPCMS_TYPEOF(*x_ptr) & x = *x_ptr;"), "{out}");
    // the loop variable is a scope variable inside the body
    assert!(out.contains("out() << cppcms::filters::escape(x);"), "{out}");
    // the separator runs for every element but the first
    assert!(
        out.contains("if(x_ptr != (content.items).begin()) {"),
        "{out}"
    );
    assert!(out.contains("out() << \",\";"), "{out}");
    assert!(out.contains("} // end of separator"), "{out}");
    assert!(out.contains("} // end of item"), "{out}");
}

#[test]
fn test_foreach_reverse_rowid_as_and_empty() {
    let out = emit_body(
        "<% foreach x as data::iter rowid r reverse in items %>\
         <% item %><%= r %><% end item %>\
         <% empty %>none<% end foreach %>",
    );
    assert!(
        out.contains("if((content.items).rbegin() != (content.items).rend()) {"),
        "{out}"
    );
    assert!(out.contains("int r = 1;"), "{out}");
    assert!(
        out.contains(
            "for (data::iter x_ptr = (content.items).rbegin(), x_ptr_end = \
             (content.items).rend(); x_ptr != x_ptr_end; ++x_ptr, ++r) {"
        ),
        "{out}"
    );
    assert!(
        out.contains("std::iterator_traits <data::iter >::value_type & x = *x_ptr;"),
        "{out}"
    );
    assert!(out.contains("out() << cppcms::filters::escape(r);"), "{out}");
    assert!(out.contains("} else {"), "{out}");
    assert!(out.contains("out() << \"none\";"), "{out}");
    assert!(out.contains("} // end of empty"), "{out}");
}

#[test]
fn test_cache_emission() {
    let out = emit_body("<% cache \"k\" for 60 %>x<% end cache %>");
    assert!(
        out.contains("if (content.app().cache().fetch_frame(\"k\", _cppcms_temp_val))"),
        "{out}"
    );
    assert!(
        out.contains("cppcms::copy_filter _cppcms_cache_flt(out());"),
        "{out}"
    );
    assert!(
        out.contains("cppcms::triggers_recorder _cppcms_trig_rec(content.app().cache());"),
        "{out}"
    );
    assert!(
        out.contains(
            "content.app().cache().store_frame(\"k\", _cppcms_cache_flt.detach(),\
             _cppcms_trig_rec.detach(),60, false);"
        ),
        "{out}"
    );
}

#[test]
fn test_cache_no_triggers_no_recording() {
    let out = emit_body(
        "<% cache stamp() on miss rebuild() no triggers no recording %>x<% end cache %>",
    );
    assert!(!out.contains("_cppcms_trig_rec"), "{out}");
    assert!(out.contains("\t\tcontent.rebuild();"), "{out}");
    assert!(
        out.contains("store_frame(content.stamp(), _cppcms_cache_flt.detach(),\
                      std::set <std::string > (),-1, true);"),
        "{out}"
    );
}

#[test]
fn test_include_emission() {
    let out = emit_body("<% include helper(x, 2) %>");
    assert!(out.contains("helper(content.x, 2);"), "{out}");
}

#[test]
fn test_include_from_scope_variable() {
    let out = emit(
        "<% skin s %><% view v uses data::c %>\
         <% template render(some_view & base) %><% include inner() from base %>\
         <% end template %><% end view %><% end skin %>",
    );
    assert!(out.contains("base.inner();"), "{out}");
}

#[test]
fn test_include_from_unknown_variable_rejected() {
    let err = emit_err(&wrap("<% include inner() from nowhere %>"));
    let EmitError::AtLine(_, msg) = err else {
        panic!("expected a positioned error, got {err:?}");
    };
    assert!(
        msg.contains("No local view variable nowhere found in context."),
        "{msg}"
    );
}

#[test]
fn test_include_using_emission() {
    let out = emit_body("<% include page() using ns::helper with sub %>");
    assert!(
        out.contains("cppcms::base_content::app_guard _g(content.sub, content);"),
        "{out}"
    );
    assert!(out.contains("ns::helper _using(out(), content.sub);"), "{out}");
    assert!(out.contains("_using.page();"), "{out}");
}

#[test]
fn test_using_block_emission() {
    let out = emit_body("<% using ns::helper as hv %><% include page() from hv %><% end using %>");
    assert!(out.contains("ns::helper hv(out(), content);"), "{out}");
    assert!(out.contains("hv.page();"), "{out}");
}

#[test]
fn test_gt_emission() {
    let out = emit_body("<% gt \"hello\" %>");
    assert!(
        out.contains("out() << cppcms::locale::translate(\"hello\");"),
        "{out}"
    );

    let out = emit_body("<% gt \"hello {1}\" using who %>");
    assert!(
        out.contains(
            "out() << cppcms::locale::format(cppcms::locale::translate(\"hello {1}\"))  \
             % (cppcms::filters::escape(content.who));"
        ),
        "{out}"
    );
}

#[test]
fn test_ngt_emission() {
    let out = emit_body("<% ngt \"one\", \"many\", n %>");
    assert!(
        out.contains(
            "out() << cppcms::locale::translate(\"one\", \"many\", content.n);"
        ),
        "{out}"
    );
}

#[test]
fn test_url_emission() {
    let out = emit_body("<% url \"/user\" using id %>");
    assert!(
        out.contains(
            "content.app().mapper().map(out(), \"/user\", \
             cppcms::filters::urlencode(content.id));"
        ),
        "{out}"
    );
}

#[test]
fn test_format_registers_include() {
    let out = emit_body("<% format \"x={1}\" using x %>");
    assert!(out.starts_with("#include <boost/format.hpp>\n"), "{out}");
    assert!(
        out.contains("out() << cppcms::filters::escape((boost::format(\"x={1}\")% (content.x)).str());"),
        "{out}"
    );

    let out = emit_body("<% rformat \"x={1}\" using x %>");
    assert!(out.starts_with("#include <boost/format.hpp>\n"), "{out}");
    assert!(
        out.contains("out() << (boost::format(\"x={1}\")% (content.x)).str();"),
        "{out}"
    );
}

#[test]
fn test_render_emission() {
    let out = emit_body("<% render \"other\", \"page\" with sub %>");
    assert!(
        out.contains(
            "cppcms::views::pool::instance().render(\"other\", \"page\", out(), content.sub);"
        ),
        "{out}"
    );

    // without an explicit skin the current one is used
    let out = emit_body("<% render view_name %>");
    assert!(
        out.contains(
            "cppcms::views::pool::instance().render(\"s\", content.view_name, out(), content);"
        ),
        "{out}"
    );
}

#[test]
fn test_csrf_emission() {
    let out = emit_body("<% csrf token %>");
    assert!(
        out.contains("out() << content.app().session().get_csrf_token();"),
        "{out}"
    );

    let out = emit_body("<% csrf cookie %>");
    assert!(
        out.contains("out() << content.app().session().get_csrf_token_cookie_name();"),
        "{out}"
    );

    let out = emit_body("<% csrf script %>");
    assert!(out.contains("<script type='text/javascript'>"), "{out}");

    let out = emit_body("<% csrf %>");
    assert!(out.contains("name=\\\"_csrf\\\""), "{out}");
}

#[test]
fn test_unknown_csrf_style_is_a_logic_error() {
    let err = emit_err(&wrap("<% csrf bogus %>"));
    assert_eq!(err, EmitError::Logic("Invalid csrf style: bogus".to_string()));
}

#[test]
fn test_form_emission() {
    let out = emit_body("<% form as_p f %>");
    assert!(
        out.contains(
            "cppcms::form_context _form_context(out(), cppcms::form_flags::as_html, \
             cppcms::form_flags::as_p); "
        ),
        "{out}"
    );
    assert!(out.contains("(content.f).render(_form_context); "), "{out}");

    let out = emit_body("<% form input f %>");
    assert!(out.contains("out() << (content.f).attributes_string();"), "{out}");

    let out = emit_body("<% form block f %>inner<% form end f %>");
    assert!(
        out.contains("_form_context.widget_part(cppcms::form_context::first_part);"),
        "{out}"
    );
    assert!(out.contains("out() << \"inner\";"), "{out}");
    assert!(
        out.contains("_form_context.widget_part(cppcms::form_context::second_part);"),
        "{out}"
    );
}

#[test]
fn test_output_mode_flows_into_forms() {
    let parser = parse(
        "<% xhtml %><% skin s %><% view v uses data::c %><% template render() %>\
         <% form as_p f %><% end template %><% end view %><% end skin %>",
    );
    let mut ctx = Context::new();
    ctx.output_mode = parser.ast().mode().unwrap().as_str().to_string();
    let out = generate(parser.ast(), &mut ctx).unwrap();
    assert!(out.contains("cppcms::form_flags::as_xhtml"), "{out}");
}

#[test]
fn test_line_pragmas_reference_source() {
    let out = emit_body("<%= x %>");
    assert!(out.contains("#line 1 \"test.tmpl\""), "{out}");
}

#[test]
fn test_root_cpp_blocks_come_before_skins() {
    let out = emit(
        "<% c++ #include \"data.h\" %><% skin s %><% view v uses data::c %>\
         <% template render() %><% end template %><% end view %><% end skin %>",
    );
    let cpp = out.find("#include \"data.h\"").expect("cpp block missing");
    let ns = out.find("namespace s {").expect("namespace missing");
    assert!(cpp < ns, "{out}");
}

#[test]
fn test_variable_prefix_is_configurable() {
    let parser = parse(&wrap("<%= x %>"));
    let mut ctx = Context::new();
    ctx.variable_prefix = "self.".to_string();
    let out = generate(parser.ast(), &mut ctx).unwrap();
    assert!(out.contains("out() << cppcms::filters::escape(self.x);"), "{out}");
}

#[test]
fn test_config_parsing() {
    let config = Config::new(
        "[general]\nvariable_prefix = \"page.\"\nskin = \"mirror\"\noutput_mode = \"text\"\n",
    )
    .unwrap();
    assert_eq!(config.variable_prefix, "page.");
    assert_eq!(config.skin.as_deref(), Some("mirror"));
    assert_eq!(config.output_mode.as_deref(), Some("text"));

    let config = Config::new("").unwrap();
    assert_eq!(config.variable_prefix, "content.");
    assert!(config.skin.is_none());

    assert!(Config::new("[general]\noutput_mode = \"pdf\"\n").is_err());
    assert!(Config::new("not toml at all [").is_err());
}

#[test]
fn test_context_from_config() {
    let config = Config::new(
        "[general]\nvariable_prefix = \"page.\"\nskin = \"mirror\"\noutput_mode = \"text\"\n",
    )
    .unwrap();
    let ctx = Context::from_config(&config);
    assert_eq!(ctx.variable_prefix, "page.");
    assert_eq!(ctx.skin.as_deref(), Some("mirror"));
    assert_eq!(ctx.output_mode, "text");
}

#[test]
fn test_duplicate_scope_variable_rejected() {
    let err = emit_err(
        "<% skin s %><% view v uses data::c %>\
         <% template render(int x) %>\
         <% foreach x in items %><% item %>a<% end item %><% end foreach %>\
         <% end template %><% end view %><% end skin %>",
    );
    assert_eq!(
        err,
        EmitError::Plain("duplicate local scope variable: x".to_string())
    );
}
